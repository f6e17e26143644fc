use async_trait::async_trait;
use reqwest::{Client, Method, Url, header};
use serde_json::json;
use tera::{Context, Tera};

use super::{ConfigError, Notifier, SendError};
use crate::notifications::clients::ClientRegistry;
use crate::notifications::models::NotifierConfig;

pub const SERVICE: &str = "webhook";

const BODY_TEMPLATE: &str = "body";

/// A sender for pushing notifications via a custom webhook.
///
/// The body template is compiled once at configure time and rendered with
/// `title` and `message` on every send. Without a template, `GET`-like
/// requests carry both as query parameters and the rest as a JSON object.
pub struct WebhookNotifier {
    client: Client,
    url: Url,
    method: Method,
    headers: header::HeaderMap,
    body: Option<Tera>,
}

impl WebhookNotifier {
    pub fn configure(config: &NotifierConfig, clients: &ClientRegistry) -> Result<Self, ConfigError> {
        let raw_url = config.non_empty("url").ok_or(ConfigError::MissingField {
            service: SERVICE,
            field: "url",
        })?;
        let url = Url::parse(raw_url).map_err(|e| ConfigError::invalid(SERVICE, "url", e))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::invalid(
                SERVICE,
                "url",
                format!("unsupported scheme: {}", url.scheme()),
            ));
        }

        let method = match config.non_empty("method") {
            Some(method) => Method::from_bytes(method.to_uppercase().as_bytes())
                .map_err(|e| ConfigError::invalid(SERVICE, "method", e))?,
            None => Method::GET,
        };

        let headers = parse_headers(config.get("headers").unwrap_or_default())?;

        let body = match config.get("body").filter(|body| !body.is_empty()) {
            Some(template) => {
                let mut tera = Tera::default();
                tera.add_raw_template(BODY_TEMPLATE, template)
                    .map_err(|e| ConfigError::Template {
                        service: SERVICE,
                        reason: e.to_string(),
                    })?;
                Some(tera)
            }
            None => None,
        };

        Ok(Self {
            client: clients.http().clone(),
            url,
            method,
            headers,
            body,
        })
    }

    fn render_body(&self, tera: &Tera, title: &str, message: &str) -> Result<String, SendError> {
        let mut context = Context::new();
        context.insert("title", title);
        context.insert("message", message);
        tera.render(BODY_TEMPLATE, &context)
            .map_err(|e| SendError::Template(e.to_string()))
    }
}

/// Parses `Key: Value; Key2: Value2`. Segments without a colon are skipped.
fn parse_headers(raw: &str) -> Result<header::HeaderMap, ConfigError> {
    let mut header_map = header::HeaderMap::new();
    for pair in raw.split(';') {
        let Some((key, value)) = pair.trim().split_once(':') else {
            continue;
        };
        let header_name = header::HeaderName::from_bytes(key.trim().as_bytes())
            .map_err(|e| ConfigError::invalid(SERVICE, "headers", format!("Invalid header name: {e}")))?;
        let header_value = header::HeaderValue::from_str(value.trim())
            .map_err(|e| ConfigError::invalid(SERVICE, "headers", format!("Invalid header value: {e}")))?;
        header_map.append(header_name, header_value);
    }
    Ok(header_map)
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn service(&self) -> &'static str {
        SERVICE
    }

    async fn send(&self, title: &str, body: &str) -> Result<(), SendError> {
        let mut request_builder = self
            .client
            .request(self.method.clone(), self.url.clone())
            .headers(self.headers.clone());

        match &self.body {
            Some(tera) => {
                let rendered_body = self.render_body(tera, title, body)?;
                if !self.headers.contains_key(header::CONTENT_TYPE) {
                    request_builder =
                        request_builder.header(header::CONTENT_TYPE, "application/json");
                }
                request_builder = request_builder.body(rendered_body);
            }
            // without a template the notification still travels with the request
            None if [Method::GET, Method::HEAD, Method::DELETE].contains(&self.method) => {
                request_builder = request_builder.query(&[("title", title), ("message", body)]);
            }
            None => {
                request_builder = request_builder.json(&json!({ "title": title, "message": body }));
            }
        }

        let response = request_builder.send().await?;
        SendError::check_status(SERVICE, response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::clients::Endpoints;
    use httpmock::prelude::*;

    fn clients() -> ClientRegistry {
        ClientRegistry::new(Client::new(), Endpoints::default(), None, None)
    }

    #[test]
    fn headers_parse_from_a_semicolon_list() {
        let headers = parse_headers("X-Token: abc;  Accept : text/plain ; junk;").unwrap();
        assert_eq!(headers["x-token"], "abc");
        assert_eq!(headers["accept"], "text/plain");
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn url_is_required_and_must_be_http() {
        let missing = NotifierConfig::new().with("service", SERVICE);
        assert_eq!(
            WebhookNotifier::configure(&missing, &clients()).err().unwrap().to_string(),
            "webhook: url is empty"
        );

        let ftp = NotifierConfig::new().with("service", SERVICE).with("url", "ftp://example.test");
        assert!(matches!(
            WebhookNotifier::configure(&ftp, &clients()),
            Err(ConfigError::InvalidField { field: "url", .. })
        ));
    }

    #[test]
    fn broken_template_fails_at_configure_time() {
        let config = NotifierConfig::new()
            .with("service", SERVICE)
            .with("url", "https://example.test/hook")
            .with("body", "{{ title ");
        assert!(matches!(
            WebhookNotifier::configure(&config, &clients()),
            Err(ConfigError::Template { .. })
        ));
    }

    #[tokio::test]
    async fn renders_the_template_and_honours_method_and_headers() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/hook")
                    .header("x-token", "abc")
                    .header("content-type", "application/json")
                    .body(r#"{"text":"hello: world"}"#);
                then.status(200);
            })
            .await;

        let config = NotifierConfig::new()
            .with("service", SERVICE)
            .with("url", server.url("/hook"))
            .with("method", "post")
            .with("headers", "X-Token: abc")
            .with("body", r#"{"text":"{{ title }}: {{ message }}"}"#);
        let notifier = WebhookNotifier::configure(&config, &clients()).unwrap();
        notifier.send("hello", "world").await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn undefined_variable_is_a_send_error_not_a_panic() {
        let config = NotifierConfig::new()
            .with("service", SERVICE)
            .with("url", "http://127.0.0.1:9/never")
            .with("body", "{{ nope }}");
        let notifier = WebhookNotifier::configure(&config, &clients()).unwrap();
        let err = notifier.send("t", "m").await.unwrap_err();
        assert!(matches!(err, SendError::Template(_)));
    }

    #[tokio::test]
    async fn post_without_template_sends_a_json_object() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/hook")
                    .json_body(serde_json::json!({ "title": "t", "message": "m" }));
                then.status(204);
            })
            .await;

        let config = NotifierConfig::new()
            .with("service", SERVICE)
            .with("url", server.url("/hook"))
            .with("method", "POST");
        let notifier = WebhookNotifier::configure(&config, &clients()).unwrap();
        notifier.send("t", "m").await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn non_success_status_is_a_send_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/hook");
                then.status(500).body("boom");
            })
            .await;

        let config = NotifierConfig::new().with("service", SERVICE).with("url", server.url("/hook"));
        let notifier = WebhookNotifier::configure(&config, &clients()).unwrap();
        let err = notifier.send("t", "m").await.unwrap_err();
        assert!(matches!(err, SendError::Status { body, .. } if body == "boom"));
    }
}
