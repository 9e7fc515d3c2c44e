//! Connection upgrade (WebSocket) dispatch.
//!
//! Upgrades bypass the HTTP middleware stack. Only routes with `ws: true`
//! are eligible; when none matches, the connection is closed without a
//! response.

use crate::{
    proxy::{ProxyHandler, UpstreamClient, UpstreamTarget},
    routes::RouteTable,
    Error, Result,
};
use hyper::{
    header::{CONNECTION, UPGRADE},
    Body, Request, Response, StatusCode,
};
use metrics::counter;
use std::{net::SocketAddr, sync::Arc};
use tokio::io::copy_bidirectional;
use tracing::{debug, error, info};

/// `Connection: upgrade` together with an `Upgrade` header.
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let wants_upgrade = req
        .headers()
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    wants_upgrade && req.headers().contains_key(UPGRADE)
}

#[derive(Debug, Clone)]
pub struct UpgradeRouter {
    routes: Arc<RouteTable>,
    client: UpstreamClient,
}

impl UpgradeRouter {
    pub fn new(routes: Arc<RouteTable>, client: UpstreamClient) -> Self {
        Self { routes, client }
    }

    /// Route an upgrade request. `Err` means no `ws` route matched and the
    /// caller must drop the connection.
    pub async fn handle(
        &self,
        req: Request<Body>,
        remote_addr: SocketAddr,
    ) -> Result<Response<Body>> {
        let path = req.uri().path().to_string();

        let registration = match self.routes.find_upgrade(&path) {
            Some(registration) => registration,
            None => {
                debug!(path = %path, client = %remote_addr, "No WebSocket route, closing connection");
                return Err(Error::UpgradeRejected { path });
            }
        };

        info!(route = registration.path(), path = %path, "Proxying WebSocket upgrade");
        counter!("revx_upgrades_total", 1, "route" => registration.path().to_string());

        let handler = &registration.handler;
        let target = handler.select_target(remote_addr);
        match self.open_tunnel(handler, req, &target).await {
            Ok(response) => Ok(response),
            Err(err) => Ok(handler.fail(&target, err)),
        }
    }

    async fn open_tunnel(
        &self,
        handler: &ProxyHandler,
        mut req: Request<Body>,
        target: &str,
    ) -> Result<Response<Body>> {
        let upstream = UpstreamTarget::parse(target)?;
        let client_side = hyper::upgrade::on(&mut req);
        let upstream_req = handler.prepare_request(req, &upstream, true)?;

        let permit = self.client.acquire().await?;
        let mut response = self
            .client
            .send(upstream_req, handler.timeout(), target)
            .await?;

        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            debug!(
                route = handler.route(),
                status = response.status().as_u16(),
                "Upstream declined upgrade"
            );
            return Ok(response);
        }

        let upstream_side = hyper::upgrade::on(&mut response);
        let route = handler.route().to_string();
        tokio::spawn(async move {
            let _permit = permit;
            match tokio::try_join!(client_side, upstream_side) {
                Ok((mut client_io, mut upstream_io)) => {
                    match copy_bidirectional(&mut client_io, &mut upstream_io).await {
                        Ok((from_client, from_upstream)) => debug!(
                            route = %route,
                            from_client,
                            from_upstream,
                            "WebSocket tunnel closed"
                        ),
                        Err(err) => debug!(route = %route, error = %err, "WebSocket tunnel ended"),
                    }
                }
                Err(err) => error!(route = %route, error = %err, "WebSocket upgrade failed"),
            }
        });

        let (parts, _) = response.into_parts();
        Ok(Response::from_parts(parts, Body::empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_upgrade_requests() {
        let req = Request::builder()
            .header(CONNECTION, "keep-alive, Upgrade")
            .header(UPGRADE, "websocket")
            .body(())
            .unwrap();
        assert!(is_upgrade_request(&req));

        let no_upgrade_header = Request::builder()
            .header(CONNECTION, "upgrade")
            .body(())
            .unwrap();
        assert!(!is_upgrade_request(&no_upgrade_header));

        let plain = Request::builder()
            .header(CONNECTION, "keep-alive")
            .header(UPGRADE, "websocket")
            .body(())
            .unwrap();
        assert!(!is_upgrade_request(&plain));
    }
}
