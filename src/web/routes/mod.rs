pub mod connect_routes;
pub mod hook_routes;
pub mod installation_routes;
pub mod settings_routes;
pub mod telegram_routes;
