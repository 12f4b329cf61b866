//! Coordinator side of the event bus.

use crate::protocol::Event;
use crate::transport::{ClientLink, Connector, Link};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Receives the events a coordinator gets from the server.
pub trait EventHandler: Send + Sync {
    /// Handles one inbound event. Must not block.
    fn handle_event(&self, event: Event);
}

/// Connects, answers `idn` and feeds events to `handler`, reconnecting forever.
///
/// Runs until the task is aborted.
pub async fn run_client<H: EventHandler + ?Sized>(
    connector: Arc<dyn Connector>,
    link: ClientLink,
    handler: Arc<H>,
    reconnect_delay: Duration,
) {
    loop {
        match connector.connect().await {
            Ok(Link {
                outbound,
                mut inbound,
            }) => {
                let generation = link.attach(outbound);
                info!(
                    identity = %link.identity(),
                    server = %connector.describe(),
                    "connected to server"
                );

                while let Some(event) = inbound.recv().await {
                    match event {
                        Event::Idn(None) => {
                            let idn = Event::Idn(Some(link.identity().to_string()));
                            if let Err(err) = link.emit(idn) {
                                warn!(error = %err, "could not answer idn");
                            }
                        }
                        Event::Idn(Some(other)) => {
                            debug!(idn = %other, "ignoring foreign identity");
                        }
                        event => handler.handle_event(event),
                    }
                }

                link.detach(generation);
                warn!(identity = %link.identity(), "disconnected from server");
            }
            Err(err) => {
                warn!(server = %connector.describe(), error = %err, "connection failed");
            }
        }
        tokio::time::sleep(reconnect_delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::StepId;
    use crate::protocol::{ClientIdentity, Role};
    use crate::transport::MemoryHub;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<Event>>);

    impl EventHandler for Collect {
        fn handle_event(&self, event: Event) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[tokio::test]
    async fn answers_idn_and_reconnects() {
        let (hub, mut accept) = MemoryHub::new();
        let link = ClientLink::new(
            ClientIdentity::new(Role::Magnetism, "lab1"),
            Duration::from_millis(100),
        );
        let handler = Arc::new(Collect::default());
        let client = tokio::spawn(run_client(
            Arc::new(hub),
            link.clone(),
            handler.clone(),
            Duration::from_millis(5),
        ));

        let mut server = accept.recv().await.unwrap();
        server.outbound.send(Event::Idn(None)).unwrap();
        assert_eq!(
            server.inbound.recv().await,
            Some(Event::Idn(Some("magnetism_lab1".into())))
        );
        server
            .outbound
            .send(Event::StepReadyForMeasurement(StepId(3)))
            .unwrap();

        // dropping the server side makes the client come back
        drop(server);
        let _again = accept.recv().await.unwrap();
        assert_eq!(
            handler.0.lock().unwrap().as_slice(),
            &[Event::StepReadyForMeasurement(StepId(3))]
        );
        client.abort();
    }
}
