//! Transport for a volume mounted on this machine.

use super::{Endpoint, Transport};
use async_trait::async_trait;
use std::path::Path;

pub struct LocalTransport {
    endpoint: Endpoint,
}

impl LocalTransport {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn local_root(&self) -> &Path {
        &self.endpoint.path
    }

    fn wrap(&self, argv: Vec<String>) -> Vec<String> {
        argv
    }

    fn rsync_location(&self, path: &Path) -> (String, Option<String>) {
        (path.to_string_lossy().into_owned(), None)
    }

    async fn teardown(&mut self) {}
}
