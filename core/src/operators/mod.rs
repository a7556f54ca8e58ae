//! Built-in workflow operators

pub mod cancel_check;
pub mod cancel_router;
pub mod delay;
pub mod entry;
pub mod exit;
pub mod kv;
pub mod trigger;
pub mod update;
pub mod user_status;

pub use cancel_check::CancelCheckOperator;
pub use cancel_router::CancelRouterOperator;
pub use delay::DelayOperator;
pub use entry::EntryOperator;
pub use exit::ExitOperator;
pub use kv::{KvGetOperator, KvSetOperator};
pub use trigger::TriggerOperator;
pub use update::UpdateListenerOperator;
pub use user_status::UserStatusOperator;
