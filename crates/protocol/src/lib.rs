pub mod channel;
pub mod endpoint;
pub mod framed;
pub mod wire;

pub use channel::{ChannelEndpoint, ChannelRequest};
pub use endpoint::{DeliveryReply, Endpoint, EndpointError};
pub use framed::FramedEndpoint;
pub use wire::{
    CrankOutcome, Delivery, DeliveryRequest, Disposition, NotifyResolution, ResolveEntry,
    SyscallRequest, TerminateRequest,
};
