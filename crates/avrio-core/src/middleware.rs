//! Two-phase middleware pipeline.
//!
//! Middleware wraps both client emission and server dispatch. The forward
//! phase runs in insertion order up to the transition (send on a client,
//! handler dispatch on a server); the backward phase unwinds in reverse
//! order once the transition has completed.
//!
//! A middleware short-circuits the rest of the forward phase — and the
//! transition itself — by returning an error from `forward` or by settling
//! the wrapped response before returning. Backward hooks of every middleware
//! whose forward ran still fire, each seeing (and free to replace) the error
//! propagated by the one below it.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::envelope::{CallContext, WrappedRequest, WrappedResponse};
use crate::error::RpcError;

pub trait Middleware: Send + Sync {
    /// Forward phase. Runs before the transition, in insertion order.
    fn forward<'a>(
        &'a self,
        ctx: &'a CallContext,
        wreq: &'a mut WrappedRequest,
        wres: &'a mut WrappedResponse,
    ) -> BoxFuture<'a, Result<(), RpcError>> {
        let _ = (ctx, wreq, wres);
        Box::pin(async { Ok(()) })
    }

    /// Backward phase. Runs after the transition, in reverse order, for
    /// every middleware whose forward phase ran. Replacing `err` changes the
    /// propagating cause for the middleware above.
    fn backward<'a>(
        &'a self,
        ctx: &'a CallContext,
        wreq: &'a WrappedRequest,
        wres: &'a mut WrappedResponse,
        err: &'a mut Option<RpcError>,
    ) -> BoxFuture<'a, ()> {
        let _ = (ctx, wreq, wres, err);
        Box::pin(async {})
    }
}

/// Run the forward phase. Returns how many middlewares ran and the error, if
/// one of them raised it. The caller runs the transition only when no error
/// was raised and the response is still unsettled.
pub(crate) async fn run_forward(
    middlewares: &[Arc<dyn Middleware>],
    ctx: &CallContext,
    wreq: &mut WrappedRequest,
    wres: &mut WrappedResponse,
) -> (usize, Option<RpcError>) {
    let mut ran = 0;
    for middleware in middlewares {
        ran += 1;
        if let Err(e) = middleware.forward(ctx, wreq, wres).await {
            return (ran, Some(e));
        }
        if wres.is_settled() {
            break;
        }
    }
    (ran, None)
}

/// Unwind the backward phase over the first `ran` middlewares, last first.
pub(crate) async fn run_backward(
    middlewares: &[Arc<dyn Middleware>],
    ran: usize,
    ctx: &CallContext,
    wreq: &WrappedRequest,
    wres: &mut WrappedResponse,
    err: &mut Option<RpcError>,
) {
    for middleware in middlewares[..ran].iter().rev() {
        middleware.backward(ctx, wreq, wres, err).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::ChannelInfo;
    use crate::error::ErrorCode;
    use crate::service::ping_message;
    use apache_avro::types::Value;
    use parking_lot::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        settle: bool,
        fail: bool,
    }

    impl Middleware for Recorder {
        fn forward<'a>(
            &'a self,
            _ctx: &'a CallContext,
            _wreq: &'a mut WrappedRequest,
            wres: &'a mut WrappedResponse,
        ) -> BoxFuture<'a, Result<(), RpcError>> {
            Box::pin(async move {
                self.log.lock().push(format!("{}>", self.name));
                if self.fail {
                    return Err(RpcError::new(ErrorCode::InternalServerError, "forward failed"));
                }
                if self.settle {
                    wres.response = Some(Value::String("shortcut".into()));
                }
                Ok(())
            })
        }

        fn backward<'a>(
            &'a self,
            _ctx: &'a CallContext,
            _wreq: &'a WrappedRequest,
            _wres: &'a mut WrappedResponse,
            _err: &'a mut Option<RpcError>,
        ) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                self.log.lock().push(format!("<{}", self.name));
            })
        }
    }

    fn harness() -> (CallContext, WrappedRequest, WrappedResponse) {
        let message = ping_message().clone();
        let ctx = CallContext::new(
            message.clone(),
            ChannelInfo {
                scope: None,
                prefix: 0,
                stateless: false,
                server: false,
            },
        );
        let wreq = WrappedRequest::new(message, Value::Record(vec![]));
        (ctx, wreq, WrappedResponse::default())
    }

    fn recorder(
        name: &'static str,
        log: &Arc<Mutex<Vec<String>>>,
    ) -> Arc<dyn Middleware> {
        Arc::new(Recorder {
            name,
            log: log.clone(),
            settle: false,
            fail: false,
        })
    }

    #[tokio::test]
    async fn backward_phase_is_reverse_of_forward() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = vec![recorder("m1", &log), recorder("m2", &log), recorder("m3", &log)];
        let (ctx, mut wreq, mut wres) = harness();

        let (ran, mut err) = run_forward(&chain, &ctx, &mut wreq, &mut wres).await;
        assert_eq!(ran, 3);
        assert!(err.is_none());
        log.lock().push("transition".into());
        run_backward(&chain, ran, &ctx, &wreq, &mut wres, &mut err).await;

        assert_eq!(
            *log.lock(),
            vec!["m1>", "m2>", "m3>", "transition", "<m3", "<m2", "<m1"]
        );
    }

    #[tokio::test]
    async fn settling_the_response_bypasses_the_rest() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = vec![
            recorder("m1", &log),
            Arc::new(Recorder {
                name: "m2",
                log: log.clone(),
                settle: true,
                fail: false,
            }) as Arc<dyn Middleware>,
            recorder("m3", &log),
        ];
        let (ctx, mut wreq, mut wres) = harness();

        let (ran, mut err) = run_forward(&chain, &ctx, &mut wreq, &mut wres).await;
        assert_eq!(ran, 2);
        assert!(wres.is_settled());
        run_backward(&chain, ran, &ctx, &wreq, &mut wres, &mut err).await;

        // m3 never ran, in either direction; m1's backward hook still fires.
        assert_eq!(*log.lock(), vec!["m1>", "m2>", "<m2", "<m1"]);
    }

    #[tokio::test]
    async fn forward_error_skips_to_the_backward_phase() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = vec![
            recorder("m1", &log),
            Arc::new(Recorder {
                name: "m2",
                log: log.clone(),
                settle: false,
                fail: true,
            }) as Arc<dyn Middleware>,
            recorder("m3", &log),
        ];
        let (ctx, mut wreq, mut wres) = harness();

        let (ran, mut err) = run_forward(&chain, &ctx, &mut wreq, &mut wres).await;
        assert_eq!(ran, 2);
        assert_eq!(err.as_ref().unwrap().code(), ErrorCode::InternalServerError);
        run_backward(&chain, ran, &ctx, &wreq, &mut wres, &mut err).await;
        assert_eq!(*log.lock(), vec!["m1>", "m2>", "<m2", "<m1"]);
    }

    #[tokio::test]
    async fn backward_hook_can_replace_the_error() {
        struct Rewriter;
        impl Middleware for Rewriter {
            fn backward<'a>(
                &'a self,
                _ctx: &'a CallContext,
                _wreq: &'a WrappedRequest,
                _wres: &'a mut WrappedResponse,
                err: &'a mut Option<RpcError>,
            ) -> BoxFuture<'a, ()> {
                Box::pin(async move {
                    if err.is_some() {
                        *err = Some(RpcError::new(ErrorCode::ApplicationError, "rewritten"));
                    }
                })
            }
        }

        let chain: Vec<Arc<dyn Middleware>> = vec![Arc::new(Rewriter)];
        let (ctx, mut wreq, mut wres) = harness();
        let (ran, _) = run_forward(&chain, &ctx, &mut wreq, &mut wres).await;
        let mut err = Some(RpcError::timeout());
        run_backward(&chain, ran, &ctx, &wreq, &mut wres, &mut err).await;
        assert_eq!(err.unwrap().message(), "rewritten");
    }
}
