pub mod gateway;
pub mod gateway_router;
pub mod runtime;

pub use gateway::{build_router, GatewayState};
pub use gateway_router::GatewayRouter;
pub use runtime::CoreRuntime;
