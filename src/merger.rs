//! Identifier Merger (spec §4.F): reconciles a server-assigned identifier
//! back into every still-queued request that referenced the locally-created
//! entity by its local id.

use std::sync::Arc;

use crate::error::Result;
use crate::queue::Storage;
use crate::request::types::Request;
use crate::transport::TransportResponse;

/// Host-supplied extraction of a server-authoritative identifier from a
/// successful creation response. The queue has no structural knowledge of
/// response payloads (spec §4.F treats the entity model as an external
/// collaborator), so this closure is the seam: return `Some(remote_id_bytes)`
/// when `response` carries one, `None` otherwise.
pub type IdentifierExtractor = Arc<dyn Fn(&TransportResponse) -> Option<Vec<u8>> + Send + Sync>;

/// Rewrites every queued request carrying `old_local` so it carries
/// `new_remote` instead. Each field is substituted on its own literal bytes
/// (`Request::rewritten`, spec §4.B/§4.F) rather than through a serialized
/// whole, so raw-byte fields like the body and identifier snapshot are
/// rewritten correctly regardless of how the entry happens to be encoded on
/// disk.
#[tracing::instrument(skip(storage))]
pub async fn rewrite(storage: &dyn Storage, old_local: &[u8], new_remote: &[u8]) -> Result<()> {
    let old_local = old_local.to_vec();
    let new_remote = new_remote.to_vec();
    let f = move |request: Request| request.rewritten(&old_local, &new_remote);
    storage.map(&f).await
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::queue::MemoryQueue;
    use crate::request::types::{Body, IdentifierSnapshot, Method, QueueingPolicy, RequestConfig, RequestId};

    fn request_with_local_id(path: &str, local_id: &str) -> Request {
        Request {
            id: RequestId::new(),
            config: RequestConfig {
                method: Method::Patch,
                path: path.to_string(),
                host_override: None,
                query: vec![],
                headers: vec![],
                body: Body::Raw(format!("{{\"parent\":\"{local_id}\"}}").into_bytes()),
                queueing_policy: QueueingPolicy::default(),
                background: false,
                timeout_secs: None,
                deduplicate: false,
                tag: String::new(),
            },
            identifier_snapshot: Some(IdentifierSnapshot(local_id.as_bytes().to_vec())),
        }
    }

    #[tokio::test]
    async fn rewrites_path_and_body_occurrences() {
        let storage = MemoryQueue::new();
        storage
            .append(request_with_local_id("/widgets/local-7", "local-7"))
            .await
            .unwrap();

        rewrite(&storage, b"local-7", b"remote-42").await.unwrap();

        let entry = storage.peek_first().await.unwrap().unwrap();
        assert_eq!(entry.request.config.path, "/widgets/remote-42");
        assert_eq!(
            entry.request.config.body,
            Body::Raw(b"{\"parent\":\"remote-42\"}".to_vec())
        );
        assert_eq!(
            entry.request.identifier_snapshot,
            Some(IdentifierSnapshot(b"remote-42".to_vec())),
            "the snapshot's own raw bytes are rewritten too, not just string fields"
        );
    }

    #[tokio::test]
    async fn preserves_count_and_order() {
        let storage = MemoryQueue::new();
        storage
            .append(request_with_local_id("/a/local-1", "local-1"))
            .await
            .unwrap();
        storage
            .append(request_with_local_id("/b/other", "other"))
            .await
            .unwrap();

        let before = storage.count().await.unwrap();
        rewrite(&storage, b"local-1", b"remote-9").await.unwrap();
        let after = storage.count().await.unwrap();
        assert_eq!(before, after);

        let first = storage.drop_first().await.unwrap().unwrap();
        assert_eq!(first.request.config.path, "/a/remote-9");
        let second = storage.drop_first().await.unwrap().unwrap();
        assert_eq!(second.request.config.path, "/b/other");
    }
}
