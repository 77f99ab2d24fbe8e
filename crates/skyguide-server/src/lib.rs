pub mod broadcaster;
pub mod codec;
pub mod dispatcher;
pub mod error;
pub mod methods;
pub mod registry;
pub mod rpc;
pub mod server;
pub mod session;
pub mod simulator;

pub use broadcaster::EventBroadcaster;
pub use dispatcher::Dispatcher;
pub use error::{HandlerError, RegistryError, ServerError};
pub use methods::register_guiding_methods;
pub use registry::MethodRegistry;
pub use server::{EventServer, ServerConfig};
pub use session::{ClientSession, SessionRegistry};
pub use simulator::SimulatedGuider;
