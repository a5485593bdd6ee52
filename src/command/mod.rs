//! Custom command registry and dispatcher.
//!
//! Commands are user-authored scripts stored per scope. The registry owns
//! the injected store and a cache of parsed programs; the dispatcher
//! resolves a name and runs the program under a fresh execution context.

pub mod dispatcher;
pub mod loader;
pub mod registry;
pub mod repository;
pub mod store;
pub mod types;

pub use dispatcher::{
    CommandDispatcher, DispatchError, DispatchOutcome, DEFAULT_MAX_CONCURRENT, EXECUTION_STACK_SIZE,
};
pub use loader::{CommandLoader, CommandMetadata, SyncResult};
pub use registry::CommandRegistry;
pub use repository::SqliteCommandStore;
pub use store::{CommandStore, MemoryCommandStore};
pub use types::{validate_name, Actor, NewCommand, Scope, StoredCommand, MAX_NAME_LENGTH};
