pub mod connect_service;
pub mod github_service;
pub mod installation_service;
pub mod session_service;
pub mod settings_service;
