/// Access hooks consulted by the local broker.
///
/// Every hook defaults to allowing the request.
pub trait Authorizer: Send + Sync + 'static {
    fn authenticate(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _password: Option<&str>,
    ) -> bool {
        true
    }

    fn authorize_publish(&self, _client_id: &str, _topic: &str) -> bool {
        true
    }

    fn authorize_subscribe(&self, _client_id: &str, _filter: &str) -> bool {
        true
    }
}

/// Accepts every connection, publish and subscription.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authorizer for AllowAll {}
