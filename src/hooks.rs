/// Callbacks into the host application. All methods default to no-ops.
pub trait ClientHooks: Send + Sync {
    /// Host is streaming packages in; heartbeats are postponed while true.
    fn is_async_loading(&self) -> bool {
        false
    }
    /// A cooked package changed on the server and its local copy was evicted.
    fn request_package_reload(&self, _package: &str) {}
}

pub struct NoopHooks;
impl ClientHooks for NoopHooks {}
