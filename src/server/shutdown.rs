use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

pub(crate) fn shutdown_signal() -> (RpcServerShutdownHandle, RpcServerShutdownSignal) {
    let (tx, rx) = oneshot::channel();

    (RpcServerShutdownHandle { tx: Some(tx) }, RpcServerShutdownSignal { rx })
}

/// The server stops once this is dropped or `shutdown()` is called, whichever happens first.
pub(crate) struct RpcServerShutdownHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl RpcServerShutdownHandle {
    pub(crate) fn shutdown(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

pub(crate) struct RpcServerShutdownSignal {
    rx: oneshot::Receiver<()>,
}

impl Future for RpcServerShutdownSignal {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Sent or dropped, both mean stop.
        Pin::new(&mut self.rx).poll(cx).map(|_| ())
    }
}
