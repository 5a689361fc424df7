pub mod block;
pub mod message;
pub mod observe;
pub mod request;
pub mod resource;

pub use self::{
    block::BlockLayer, message::MessageLayer, observe::ObserveLayer, request::RequestLayer,
};
