//! Lockstep Adapter
//!
//! The polymorphic leaf-execution surface. A [`TaskAdapter`] turns
//! `(args, context)` into a lazy event stream; the engine resolves adapters
//! by a node's kind tag through the [`AdapterRegistry`].
//!
//! Adapters never fail synchronously: every failure is an
//! [`AdapterEvent::Failed`] item on the stream. They honor the run's
//! cancellation token by tearing down external subscriptions, without
//! claiming to undo work already dispatched to the outside world.

mod adapter;
mod call;
mod command;
mod loopback;
mod registry;
mod subscribe;

pub use adapter::{AdapterContext, AdapterEvent, TaskAdapter};
pub use call::{CallRequest, CallResponse, ExternalCallAdapter, ExternalChannel};
pub use command::{Command, CommandAdapter, CommandBus, CommandState, CommandStatus};
pub use loopback::{
  CallOutcome, CommandOutcome, LoopbackBus, LoopbackChannel, LoopbackConnector, data_event,
};
pub use registry::{AdapterRegistry, RegistryError};
pub use subscribe::{
  ChannelConnector, ChannelDescriptor, ChannelEvent, ChannelSubscription, ExternalSubscribeAdapter,
};
