//! Path dispatch and method routing over the resource tree, including the
//! `/.well-known/core` discovery endpoint.

use crate::{
    Error,
    layers::resource::{
        if_match_failed, invoke, invoke_delete, link_entry, matches_filter, not_acceptable,
    },
    params::DISCOVERY_PATH,
    resource::Resource,
    transaction::Transaction,
    tree::{ResourceTree, normalize_path},
};

use std::sync::Arc;

use codec::{Code, ContentFormat, Message};
use parking_lot::RwLock;

pub struct RequestLayer {
    tree: RwLock<ResourceTree>,
}

impl Default for RequestLayer {
    fn default() -> Self {
        Self {
            tree: RwLock::new(ResourceTree::default()),
        }
    }
}

impl RequestLayer {
    /// Attach a resource. Refused when the path is taken.
    pub fn add_resource(&self, path: &str, resource: Resource) -> bool {
        let path = normalize_path(path);
        let mut tree = self.tree.write();
        if tree.contains(&path) {
            return false;
        }

        tree.insert(&path, resource);
        true
    }

    pub fn remove_resource(&self, path: &str) -> bool {
        let path = normalize_path(path);
        self.tree.write().remove(&path).is_some()
    }

    /// Registered paths, optionally filtered by prefix.
    pub fn get_resources(&self, prefix: Option<&str>) -> Vec<String> {
        let paths = self.tree.read().dump();
        match prefix {
            None => paths,
            Some(prefix) => paths
                .into_iter()
                .filter(|path| path.starts_with(prefix))
                .collect(),
        }
    }

    pub fn get_resource(&self, path: &str) -> Option<Resource> {
        self.tree.read().get(&normalize_path(path)).cloned()
    }

    /// Execute the requested method and leave the response (and the
    /// resource snapshot) on the transaction.
    pub async fn receive_request(&self, transaction: &Arc<Transaction>) -> Result<(), Error> {
        let method = transaction.lock().request.code;
        match method {
            Code::Get => self.handle_get(transaction).await,
            Code::Post => self.handle_post(transaction).await,
            Code::Put => self.handle_put(transaction).await,
            Code::Delete => self.handle_delete(transaction).await,
            _ => Ok(()),
        }
    }

    async fn handle_get(&self, transaction: &Arc<Transaction>) -> Result<(), Error> {
        let request = transaction.lock().request.clone();
        let path = normalize_path(&request.uri_path());
        let mut response = Message::response_to(&request);

        if path == DISCOVERY_PATH {
            response.code = Code::Content;
            response.payload = self.discover(&request).into_bytes();
            response.set_content_format(ContentFormat::LinkFormat);
            transaction.lock().response = Some(response);
            return Ok(());
        }

        let resource = self.tree.read().get(&path).cloned();
        let resource = match resource {
            Some(resource) if path != "/" => resource,
            _ => {
                response.code = Code::NotFound;
                transaction.lock().response = Some(response);
                return Ok(());
            }
        };

        if if_match_failed(&request, resource.etag.as_deref()) {
            response.code = Code::PreconditionFailed;
            let mut state = transaction.lock();
            state.resource = Some(resource);
            state.response = Some(response);
            return Ok(());
        }

        transaction.lock().resource = Some(resource.clone());

        let outcome = resource.handler().handle_get(&resource, &request, response);
        let (updated, mut response) = invoke(transaction, outcome).await?;

        // Accept: a representation in another format is not acceptable.
        if let Some(accept) = request.accept() {
            let produced = response.content_format().unwrap_or(ContentFormat::TextPlain);
            if produced != accept {
                let mut state = transaction.lock();
                state.response = Some(not_acceptable(&request));
                return Ok(());
            }
        }

        if response.code == Code::Empty {
            let etag_hit = resource
                .etag
                .as_deref()
                .map(|etag| request.etags().iter().any(|candidate| *candidate == etag))
                .unwrap_or(false);

            if etag_hit {
                response.code = Code::Valid;
                response.payload.clear();
            } else {
                response.code = Code::Content;
            }
        }

        let mut state = transaction.lock();
        state.resource = Some(updated);
        state.response = Some(response);
        Ok(())
    }

    async fn handle_put(&self, transaction: &Arc<Transaction>) -> Result<(), Error> {
        let request = transaction.lock().request.clone();
        let path = normalize_path(&request.uri_path());
        let mut response = Message::response_to(&request);

        let existing = self.tree.read().get(&path).cloned();
        let Some(resource) = existing else {
            return self.create_child(transaction, &request, &path, response);
        };

        if request.if_none_match() {
            response.code = Code::PreconditionFailed;
            transaction.lock().response = Some(response);
            return Ok(());
        }

        if if_match_failed(&request, resource.etag.as_deref()) {
            response.code = Code::PreconditionFailed;
            transaction.lock().response = Some(response);
            return Ok(());
        }

        transaction.lock().resource = Some(resource.clone());

        let outcome = resource.handler().handle_put(&resource, &request, response);
        let (mut updated, mut response) = invoke(transaction, outcome).await?;

        updated.changed = true;
        updated.bump_observe_count();

        // the changed marker travels on the transaction only, so later
        // reads of the tree do not re-trigger notifications
        let mut stored = updated.clone();
        stored.changed = false;
        self.tree.write().insert(&path, stored);

        if response.code == Code::Empty {
            response.code = Code::Changed;
        }

        let mut state = transaction.lock();
        state.resource = Some(updated);
        state.response = Some(response);
        Ok(())
    }

    /// PUT below a resource that allows children instantiates one of that
    /// type and attaches it under the requested path.
    fn create_child(
        &self,
        transaction: &Arc<Transaction>,
        request: &Message,
        path: &str,
        mut response: Message,
    ) -> Result<(), Error> {
        if request.if_match().iter().any(|value| value.is_empty()) {
            response.code = Code::PreconditionFailed;
            transaction.lock().response = Some(response);
            return Ok(());
        }

        let parent = self.tree.read().longest_ancestor(path).cloned();
        let factory = parent.as_ref().and_then(|p| p.allow_children.clone());

        match factory {
            Some(factory) => {
                let mut child = factory();
                child.path = path.to_string();
                child.notify_queue = parent.and_then(|p| p.notify_queue.clone());
                child.payload = request.payload.clone();
                if let Some(format) = request.content_format() {
                    child.content_type = Some(format);
                }

                self.tree.write().insert(path, child.clone());
                response.code = Code::Created;

                let mut state = transaction.lock();
                state.resource = Some(child);
                state.response = Some(response);
            }
            None => {
                response.code = Code::NotFound;
                transaction.lock().response = Some(response);
            }
        }

        Ok(())
    }

    async fn handle_post(&self, transaction: &Arc<Transaction>) -> Result<(), Error> {
        let request = transaction.lock().request.clone();
        let path = normalize_path(&request.uri_path());
        let mut response = Message::response_to(&request);

        let existing = self.tree.read().get(&path).cloned();
        let Some(resource) = existing else {
            response.code = Code::NotFound;
            transaction.lock().response = Some(response);
            return Ok(());
        };

        if request.if_none_match() {
            response.code = Code::PreconditionFailed;
            transaction.lock().response = Some(response);
            return Ok(());
        }

        transaction.lock().resource = Some(resource.clone());

        let outcome = resource.handler().handle_post(&resource, &request, response);
        let (mut updated, mut response) = invoke(transaction, outcome).await?;

        updated.changed = true;
        updated.bump_observe_count();

        let created_path = normalize_path(&updated.path);
        if created_path != path {
            // the handler produced a resource under a new path
            let known = self.tree.read().contains(&created_path);
            if !known && request.if_match().iter().any(|value| value.is_empty()) {
                let mut reply = Message::response_to(&request);
                reply.code = Code::PreconditionFailed;
                let mut state = transaction.lock();
                state.resource = None;
                state.response = Some(reply);
                return Ok(());
            }

            let mut child = updated.clone();
            child.notify_queue = resource.notify_queue.clone();
            let mut stored = child.clone();
            stored.changed = false;
            self.tree.write().insert(&created_path, stored);
            if !known {
                response.code = Code::Created;
            }

            if response.code == Code::Empty {
                response.code = Code::Changed;
            }

            let mut state = transaction.lock();
            state.resource = Some(child);
            state.response = Some(response);
            return Ok(());
        }

        let mut stored = updated.clone();
        stored.changed = false;
        self.tree.write().insert(&path, stored);

        if response.code == Code::Empty {
            response.code = Code::Changed;
        }

        let mut state = transaction.lock();
        state.resource = Some(updated);
        state.response = Some(response);
        Ok(())
    }

    async fn handle_delete(&self, transaction: &Arc<Transaction>) -> Result<(), Error> {
        let request = transaction.lock().request.clone();
        let path = normalize_path(&request.uri_path());
        let mut response = Message::response_to(&request);

        let existing = self.tree.read().get(&path).cloned();
        let Some(resource) = existing else {
            response.code = Code::NotFound;
            transaction.lock().response = Some(response);
            return Ok(());
        };

        if if_match_failed(&request, resource.etag.as_deref()) {
            response.code = Code::PreconditionFailed;
            let mut state = transaction.lock();
            state.resource = Some(resource);
            state.response = Some(response);
            return Ok(());
        }

        transaction.lock().resource = Some(resource.clone());

        let outcome = resource
            .handler()
            .handle_delete(&resource, &request, response);
        let (deleted, mut response) = invoke_delete(transaction, outcome).await?;

        let mut updated = resource;
        if deleted {
            updated.deleted = true;
            updated.bump_observe_count();
            self.tree.write().remove(&path);
        }

        if response.code == Code::Empty {
            response.code = Code::Deleted;
        }

        let mut state = transaction.lock();
        state.resource = Some(updated);
        state.response = Some(response);
        Ok(())
    }

    /// Render the discovery payload: every visible resource that passes
    /// the URI-Query filter, sorted by path, entries joined with commas.
    fn discover(&self, request: &Message) -> String {
        let query = request.uri_query();
        let tree = self.tree.read();

        let mut entries = Vec::new();
        for path in tree.dump() {
            if path == "/" {
                continue;
            }

            let resource = tree.get(&path).unwrap();
            if !resource.visible {
                continue;
            }

            if matches_filter(query.as_deref(), &resource.attributes, &path) {
                entries.push(link_entry(resource));
            }
        }

        entries.join(",")
    }
}
