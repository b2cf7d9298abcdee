//! Type-erased protobuf messages.
//!
//! `prost::Message` is not usable as a trait object, so protobuf payloads cross
//! the codec boundary wrapped in a [`ProtoValue`], which boxes the message
//! behind the object-safe [`DynMessage`] shim.

use std::any::Any;

/// Object-safe view of a `prost::Message`.
pub trait DynMessage: Send + Sync + core::fmt::Debug {
    fn encode_to_bytes(&self) -> Vec<u8>;

    /// Reset the message and merge `bytes` into it.
    fn replace_from(&mut self, bytes: &[u8]) -> Result<(), prost::DecodeError>;

    fn into_any(self: Box<Self>) -> Box<dyn Any>;

    fn as_any(&self) -> &dyn Any;
}

impl<M> DynMessage for M
where
    M: prost::Message + Default + 'static,
{
    fn encode_to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    fn replace_from(&mut self, bytes: &[u8]) -> Result<(), prost::DecodeError> {
        self.clear();
        self.merge(bytes)
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A protobuf message in the shape the `proto` codec accepts.
#[derive(Debug)]
pub struct ProtoValue(Box<dyn DynMessage>);

impl ProtoValue {
    pub fn new<M>(message: M) -> Self
    where
        M: prost::Message + Default + 'static,
    {
        Self(Box::new(message))
    }

    /// An empty `M`, used as a decode target.
    pub fn empty<M>() -> Self
    where
        M: prost::Message + Default + 'static,
    {
        Self(Box::new(M::default()))
    }

    pub fn message(&self) -> &dyn DynMessage {
        self.0.as_ref()
    }

    pub fn message_mut(&mut self) -> &mut dyn DynMessage {
        self.0.as_mut()
    }

    /// Borrow the wrapped message as `M`, if that is its concrete type.
    pub fn downcast_ref<M: 'static>(&self) -> Option<&M> {
        self.0.as_any().downcast_ref::<M>()
    }

    /// Unwrap into `M`, if that is the concrete type of the wrapped message.
    pub fn into_message<M: 'static>(self) -> Option<M> {
        self.0.into_any().downcast::<M>().ok().map(|m| *m)
    }
}
