pub mod attachments;
pub mod error;
pub mod files;
pub mod messages;
pub mod middleware;
pub mod pipeline;
pub mod profiles;
pub mod routes;
pub mod settings;
pub mod state;
pub mod ws;
