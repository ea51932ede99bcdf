pub mod chunk;
pub mod errors;
pub mod events;
pub mod ids;
pub mod messages;
pub mod provider;
pub mod settings;

pub use errors::{GatewayError, SettingsError};
pub use events::{Event, EventStream};
pub use messages::{ConversationTurn, Message, Role, RunInput};
pub use settings::Settings;
