pub mod error;
pub mod instance;
pub mod memory;
pub mod outbox;
pub mod postgres;
pub mod store;

pub use common::{CorrelationId, Version};
pub use error::{Result, SagaStoreError};
pub use instance::{ActiveSaga, MAX_STATE_NAME_LEN, SagaInstance};
pub use memory::InMemorySagaStore;
pub use outbox::OutboxMessage;
pub use postgres::PostgresSagaStore;
pub use store::{SagaStore, SagaStoreExt};
