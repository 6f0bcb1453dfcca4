use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use transport_core::TransportError;
use webrtc::util::vnet::net::{Net, NetConfig};
use webrtc::util::vnet::router::{Router, RouterConfig};

use crate::to_connection_error;

const WAN_CIDR: &str = "10.0.0.0/24";
const OFFERER_IP: &str = "10.0.0.2";
const ANSWERER_IP: &str = "10.0.0.3";

/// Two in-memory hosts behind one virtual router, so a full offer/answer/ICE
/// exchange can run without touching the OS network stack.
pub struct VirtualNetwork {
    router: Arc<AsyncMutex<Router>>,
    offerer: Arc<Net>,
    answerer: Arc<Net>,
}

impl VirtualNetwork {
    pub async fn pair() -> Result<Self, TransportError> {
        let router = Arc::new(AsyncMutex::new(
            Router::new(RouterConfig {
                cidr: WAN_CIDR.to_owned(),
                ..Default::default()
            })
            .map_err(to_connection_error)?,
        ));

        let offerer = Arc::new(Net::new(Some(NetConfig {
            static_ips: vec![OFFERER_IP.to_owned()],
            ..Default::default()
        })));
        attach_to_router(&offerer, &router).await?;

        let answerer = Arc::new(Net::new(Some(NetConfig {
            static_ips: vec![ANSWERER_IP.to_owned()],
            ..Default::default()
        })));
        attach_to_router(&answerer, &router).await?;

        router.lock().await.start().await.map_err(to_connection_error)?;

        Ok(Self {
            router,
            offerer,
            answerer,
        })
    }

    pub fn offerer_net(&self) -> Arc<Net> {
        self.offerer.clone()
    }

    pub fn answerer_net(&self) -> Arc<Net> {
        self.answerer.clone()
    }

    pub async fn shutdown(&self) -> Result<(), TransportError> {
        self.router
            .lock()
            .await
            .stop()
            .await
            .map_err(to_connection_error)
    }
}

async fn attach_to_router(
    net: &Arc<Net>,
    router: &Arc<AsyncMutex<Router>>,
) -> Result<(), TransportError> {
    let nic = net.get_nic().map_err(to_connection_error)?;
    router
        .lock()
        .await
        .add_net(Arc::clone(&nic))
        .await
        .map_err(to_connection_error)?;
    nic.lock()
        .await
        .set_router(Arc::clone(router))
        .await
        .map_err(to_connection_error)?;
    Ok(())
}
