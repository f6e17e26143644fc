use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub login: String,
    #[serde(default)]
    pub html_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Repository {
    pub full_name: String,
    #[serde(default)]
    pub html_url: String,
    #[serde(default)]
    pub stargazers_count: u64,
    pub owner: User,
}

/// The subset of GitHub's `star` webhook payload the relay reads.
#[derive(Debug, Clone, Deserialize)]
pub struct StarEvent {
    pub action: String,
    pub repository: Repository,
    pub sender: User,
}

/// Escapes text for Telegram MarkdownV2.
/// Characters to escape: _ * [ ] ( ) ~ ` > # + - = | { } . ! \
pub fn escape_markdown(text: &str) -> String {
    let mut escaped_text = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(
            c,
            '_' | '*' | '[' | ']' | '(' | ')' | '~' | '`' | '>' | '#' | '+' | '-' | '=' | '|' | '{'
                | '}' | '.' | '!' | '\\'
        ) {
            escaped_text.push('\\');
        }
        escaped_text.push(c);
    }
    escaped_text
}

/// Title and MarkdownV2 body for a star event, or `None` for actions the relay ignores.
pub fn compose(event: &StarEvent) -> Option<(String, String)> {
    let (headline, verb) = match event.action.as_str() {
        "created" => ("New GitHub Star on", "starred"),
        "deleted" => ("Lost GitHub Star on", "unstarred"),
        _ => return None,
    };
    let repo = &event.repository;
    let title = format!("{headline} {}", escape_markdown(&repo.full_name));
    let body = format!(
        "[{}]({}) {verb} [{}]({}), now it has **{}** stars\\.",
        escape_markdown(&event.sender.login),
        escape_markdown(&event.sender.html_url),
        escape_markdown(&repo.full_name),
        escape_markdown(&repo.html_url),
        repo.stargazers_count,
    );
    Some((title, body))
}
