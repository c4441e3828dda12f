use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::connection::{ClientInfo, ConnContext};
use crate::flow::Flow;

/// An observer plugged into the pipeline at fixed hook points. Every hook
/// has a no-op default, so addons implement only what they care about.
/// Flow hooks may mutate the flow and may block; connection lifecycle
/// hooks observe only.
pub trait Addon: Send + Sync + 'static {
    fn client_connected(&self, _client: &ClientInfo) {}
    fn client_disconnected(&self, _client: &ClientInfo) {}
    fn server_connected(&self, _ctx: &ConnContext) {}
    fn server_disconnected(&self, _ctx: &ConnContext) {}
    fn request_headers(&self, _flow: &mut Flow) {}
    fn request(&self, _flow: &mut Flow) {}
    fn response_headers(&self, _flow: &mut Flow) {}
    fn response(&self, _flow: &mut Flow) {}
}

/// Registration-ordered addon list, fixed before the proxy starts. Hooks
/// fire in registration order at every hook point; a panicking addon is
/// contained and the remaining addons still run with the flow as the
/// panicking one left it.
pub(crate) struct AddonChain {
    addons: Vec<Arc<dyn Addon>>,
}

impl AddonChain {
    pub(crate) fn new(addons: Vec<Arc<dyn Addon>>) -> Self {
        Self { addons }
    }

    pub(crate) fn client_connected(&self, client: &ClientInfo) {
        for addon in &self.addons {
            contained("client_connected", || addon.client_connected(client));
        }
    }

    pub(crate) fn client_disconnected(&self, client: &ClientInfo) {
        for addon in &self.addons {
            contained("client_disconnected", || addon.client_disconnected(client));
        }
    }

    pub(crate) fn server_connected(&self, ctx: &ConnContext) {
        for addon in &self.addons {
            contained("server_connected", || addon.server_connected(ctx));
        }
    }

    pub(crate) fn server_disconnected(&self, ctx: &ConnContext) {
        for addon in &self.addons {
            contained("server_disconnected", || addon.server_disconnected(ctx));
        }
    }

    /// Returns true when an addon synthesized a response: the exchange is
    /// short-circuited and the remaining addons of this hook point are
    /// skipped along with everything after it.
    pub(crate) fn request_headers(&self, flow: &mut Flow) -> bool {
        self.run_flow_hook("request_headers", flow, |addon, flow| {
            addon.request_headers(flow)
        })
    }

    pub(crate) fn request(&self, flow: &mut Flow) -> bool {
        self.run_flow_hook("request", flow, |addon, flow| addon.request(flow))
    }

    /// Returns true when an addon supplied a response body directly, which
    /// skips reading the upstream body.
    pub(crate) fn response_headers(&self, flow: &mut Flow) -> bool {
        for addon in &self.addons {
            let flow_ref = &mut *flow;
            contained("response_headers", || addon.response_headers(flow_ref));
            if flow
                .response
                .as_ref()
                .is_some_and(|response| response.body.is_some())
            {
                return true;
            }
        }
        false
    }

    pub(crate) fn response(&self, flow: &mut Flow) {
        for addon in &self.addons {
            let flow_ref = &mut *flow;
            contained("response", || addon.response(flow_ref));
        }
    }

    fn run_flow_hook<F>(&self, hook: &'static str, flow: &mut Flow, invoke: F) -> bool
    where
        F: Fn(&dyn Addon, &mut Flow),
    {
        for addon in &self.addons {
            let flow_ref = &mut *flow;
            contained(hook, || invoke(addon.as_ref(), flow_ref));
            if flow.response.is_some() {
                return true;
            }
        }
        false
    }
}

fn contained(hook: &'static str, call: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(call)).is_err() {
        tracing::warn!(hook, "addon panicked; continuing the exchange");
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    use http::{HeaderMap, Method, StatusCode, Uri, Version};

    use super::{Addon, AddonChain};
    use crate::connection::ConnContext;
    use crate::flow::{Flow, Request, Response};

    struct Recorder {
        label: &'static str,
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Addon for Recorder {
        fn request_headers(&self, _flow: &mut Flow) {
            self.calls.lock().expect("lock").push(self.label);
        }
    }

    struct Panicker;

    impl Addon for Panicker {
        fn request_headers(&self, _flow: &mut Flow) {
            panic!("addon fault");
        }
    }

    struct Teapot;

    impl Addon for Teapot {
        fn request_headers(&self, flow: &mut Flow) {
            flow.response = Some(Response::new(StatusCode::IM_A_TEAPOT).with_body("teapot"));
        }
    }

    fn test_flow() -> Flow {
        let remote: SocketAddr = "127.0.0.1:9999".parse().expect("addr");
        let request = Request {
            method: Method::GET,
            url: Uri::from_static("http://origin/x"),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: None,
        };
        Flow::new(request, Arc::new(ConnContext::new(remote)))
    }

    #[test]
    fn hooks_fire_in_registration_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let chain = AddonChain::new(vec![
            Arc::new(Recorder {
                label: "first",
                calls: Arc::clone(&calls),
            }),
            Arc::new(Recorder {
                label: "second",
                calls: Arc::clone(&calls),
            }),
        ]);

        let mut flow = test_flow();
        assert!(!chain.request_headers(&mut flow));
        assert_eq!(*calls.lock().expect("lock"), vec!["first", "second"]);
    }

    #[test]
    fn a_panicking_addon_does_not_stop_the_chain() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let chain = AddonChain::new(vec![
            Arc::new(Panicker),
            Arc::new(Recorder {
                label: "after",
                calls: Arc::clone(&calls),
            }),
        ]);

        let mut flow = test_flow();
        assert!(!chain.request_headers(&mut flow));
        assert_eq!(*calls.lock().expect("lock"), vec!["after"]);
    }

    #[test]
    fn a_synthesized_response_skips_the_remaining_addons() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let chain = AddonChain::new(vec![
            Arc::new(Teapot),
            Arc::new(Recorder {
                label: "never",
                calls: Arc::clone(&calls),
            }),
        ]);

        let mut flow = test_flow();
        assert!(chain.request_headers(&mut flow));
        assert!(calls.lock().expect("lock").is_empty());
        assert_eq!(
            flow.response.as_ref().map(|response| response.status),
            Some(StatusCode::IM_A_TEAPOT)
        );
    }
}
