/// Build version, overridable at compile time through `STARGAZER_VERSION`.
pub const VERSION: &str = match option_env!("STARGAZER_VERSION") {
    Some(val) => val,
    None => env!("CARGO_PKG_VERSION"),
};

/// Sent with every outbound request. The GitHub API rejects requests without one.
pub const USER_AGENT: &str = concat!("stargazer/", env!("CARGO_PKG_VERSION"));
