//! The capability interface between the core and user resource logic.
//!
//! A [`Resource`] is a value: the tree hands a snapshot to the handler and
//! stores whatever the handler returns. Handlers must treat their inputs
//! as read-only and express every change through the returned resource.
//!
//! A handler reply is either immediate, a future, a closure for the
//! blocking pool (synchronous handlers must not stall the driver), or a
//! continuation. Returning a continuation asks the core to emit the empty
//! ACK right away and to await the continuation for the real response
//! (separate response, RFC 7252 section 5.2.2).

use crate::params::MAX_OBSERVE_COUNT;

use std::{collections::BTreeMap, future::Future, pin::Pin, sync::Arc};

use codec::{Code, ContentFormat, Message};
use tokio::sync::mpsc::UnboundedSender;

pub type HandlerFuture = Pin<Box<dyn Future<Output = (Resource, Message)> + Send>>;
pub type DeleteFuture = Pin<Box<dyn Future<Output = (bool, Message)> + Send>>;

pub enum HandlerOutcome {
    Immediate(Resource, Message),
    Async(HandlerFuture),
    Blocking(Box<dyn FnOnce() -> (Resource, Message) + Send>),
    Separate(Box<dyn FnOnce() -> HandlerFuture + Send>),
}

pub enum DeleteOutcome {
    Immediate(bool, Message),
    Async(DeleteFuture),
    Blocking(Box<dyn FnOnce() -> (bool, Message) + Send>),
    Separate(Box<dyn FnOnce() -> DeleteFuture + Send>),
}

fn not_allowed(resource: &Resource, mut response: Message, method: &str) -> (Resource, Message) {
    response.code = Code::MethodNotAllowed;
    response.clear_options();
    response.payload = format!("{} method is not allowed.", method).into_bytes();
    (resource.clone(), response)
}

/// Leaf application logic. Every method has a refusing default, so a
/// handler only implements the methods its resource supports.
pub trait Handler: Send + Sync {
    #[allow(unused_variables)]
    fn handle_get(&self, resource: &Resource, request: &Message, response: Message) -> HandlerOutcome {
        let (resource, response) = not_allowed(resource, response, "GET");
        HandlerOutcome::Immediate(resource, response)
    }

    #[allow(unused_variables)]
    fn handle_put(&self, resource: &Resource, request: &Message, response: Message) -> HandlerOutcome {
        let (resource, response) = not_allowed(resource, response, "PUT");
        HandlerOutcome::Immediate(resource, response)
    }

    #[allow(unused_variables)]
    fn handle_post(&self, resource: &Resource, request: &Message, response: Message) -> HandlerOutcome {
        let (resource, response) = not_allowed(resource, response, "POST");
        HandlerOutcome::Immediate(resource, response)
    }

    #[allow(unused_variables)]
    fn handle_delete(&self, resource: &Resource, request: &Message, response: Message) -> DeleteOutcome {
        let (_, response) = not_allowed(resource, response, "DELETE");
        DeleteOutcome::Immediate(false, response)
    }
}

/// Factory invoked on PUT below a resource that allows children.
pub type ChildFactory = Arc<dyn Fn() -> Resource + Send + Sync>;

/// A node of the path tree.
#[derive(Clone)]
pub struct Resource {
    pub path: String,
    pub name: String,
    pub visible: bool,
    pub observable: bool,
    pub allow_children: Option<ChildFactory>,
    pub content_type: Option<ContentFormat>,
    pub etag: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub observe_count: u32,
    /// CoRE link-format attributes (`rt`, `if`, `sz`, `ct`, `obs`, ...).
    pub attributes: BTreeMap<String, String>,
    pub changed: bool,
    pub deleted: bool,
    pub notify_queue: Option<UnboundedSender<Resource>>,
    handler: Arc<dyn Handler>,
}

impl Resource {
    pub fn new(name: &str, handler: impl Handler + 'static) -> Self {
        let mut attributes = BTreeMap::new();
        attributes.insert("obs".to_string(), String::new());

        Self {
            path: String::new(),
            name: name.to_string(),
            visible: true,
            observable: true,
            allow_children: None,
            content_type: None,
            etag: None,
            payload: Vec::new(),
            observe_count: 2,
            attributes,
            changed: false,
            deleted: false,
            notify_queue: None,
            handler: Arc::new(handler),
        }
    }

    /// The invisible, non-observable tree root.
    pub(crate) fn root() -> Self {
        struct RootHandler;
        impl Handler for RootHandler {}

        let mut root = Resource::new("root", RootHandler);
        root.path = "/".to_string();
        root.visible = false;
        root.observable = false;
        root.attributes.remove("obs");
        root
    }

    pub fn visible(mut self, visible: bool) -> Self {
        self.visible = visible;
        self
    }

    pub fn observable(mut self, observable: bool) -> Self {
        self.observable = observable;
        if observable {
            self.attributes.insert("obs".to_string(), String::new());
        } else {
            self.attributes.remove("obs");
        }
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_content_type(mut self, format: ContentFormat) -> Self {
        self.content_type = Some(format);
        self
    }

    pub fn with_etag(mut self, etag: impl Into<Vec<u8>>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn with_attribute(mut self, name: &str, value: &str) -> Self {
        self.attributes.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_children(mut self, factory: ChildFactory) -> Self {
        self.allow_children = Some(factory);
        self
    }

    pub fn handler(&self) -> Arc<dyn Handler> {
        self.handler.clone()
    }

    /// Advance the observe counter, wrapping inside the 24-bit window and
    /// skipping the reserved values 0 and 1 (RFC 7641, section 4.4).
    pub fn bump_observe_count(&mut self) {
        let next = (self.observe_count + 1) % MAX_OBSERVE_COUNT;
        self.observe_count = match next {
            0 => 2,
            1 => 2,
            n => n,
        };
    }

    /// Hand this resource to the notify queue; the dispatcher fans it out
    /// to every observer.
    pub fn notify(&self) {
        if let Some(queue) = &self.notify_queue {
            let _ = queue.send(self.clone());
        }
    }
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("path", &self.path)
            .field("visible", &self.visible)
            .field("observable", &self.observable)
            .field("observe_count", &self.observe_count)
            .field("payload", &self.payload.len())
            .finish()
    }
}
