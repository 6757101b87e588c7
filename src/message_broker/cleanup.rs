use std::{future::Future, sync::Weak, time::Duration};
use tokio::{select, sync::broadcast::Receiver, time};
use tracing::debug;
use super::mediator::BrokerMediator;

/// periodic reclamation of expired sessions and idle channels
pub trait Cleanup {
    fn sweep(&self) -> impl Future<Output = ()> + Send;
}

/// sweeps every `period`, measured from the end of the previous pass
pub(crate) async fn sweeper(broker: Weak<BrokerMediator>, period: Duration, mut rx_shutdown: Receiver<()>) {
    debug!("[sweeper] start");
    'sweeper: loop {
        select! {
            _ = rx_shutdown.recv() => break 'sweeper,
            _ = time::sleep(period) => {
                let Some(broker) = broker.upgrade() else {
                    break 'sweeper;
                };
                broker.sweep().await;
            }
        }
    }
    debug!("[sweeper] shutdown");
}
