use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rocket::serde::json::Json;
use rocket::{post, routes, Build, Rocket, State};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::chord_node::ChordNode;
use crate::error::{Error, Result};
use crate::node_info::{NodeIdentity, Slot};
use crate::rpc::{DataReply, DataRequest, GetNodeValueReq, NotifyNodeChangedReq, PeerClient, TossMessage};

//
// server side: one POST route per verb, every reply is a JSON Result
//

#[post("/health_check")]
fn rrpc_health_check(node: &State<Arc<ChordNode>>) -> Json<Result<()>> {
    Json(node.health_check())
}

#[post("/get_node_value", data = "<req>")]
fn rrpc_get_node_value(node: &State<Arc<ChordNode>>, req: Json<GetNodeValueReq>) -> Json<Result<Option<NodeIdentity>>> {
    Json(node.get_node_value(req.slot))
}

#[post("/notify_node_changed", data = "<req>")]
fn rrpc_notify_node_changed(node: &State<Arc<ChordNode>>, req: Json<NotifyNodeChangedReq>) -> Json<Result<()>> {
    let req = req.into_inner();
    Json(node.inner().notify_node_changed(req.slot, req.node))
}

#[post("/toss_message", data = "<msg>")]
async fn rrpc_toss_message(node: &State<Arc<ChordNode>>, msg: Json<TossMessage>) -> Json<Result<bool>> {
    Json(node.inner().toss_message(msg.into_inner()).await)
}

#[post("/handle_data", data = "<req>")]
async fn rrpc_handle_data(node: &State<Arc<ChordNode>>, req: Json<DataRequest>) -> Json<Result<DataReply>> {
    Json(node.inner().handle_data(req.into_inner()).await)
}

pub fn build_rocket(node: Arc<ChordNode>, figment: rocket::figment::Figment) -> Rocket<Build> {
    rocket::custom(figment).manage(node).mount(
        "/",
        routes![
            rrpc_health_check,
            rrpc_get_node_value,
            rrpc_notify_node_changed,
            rrpc_toss_message,
            rrpc_handle_data
        ],
    )
}

/// Serves the node's RPC surface until the server shuts down.
pub async fn rest_api_server_start(node: Arc<ChordNode>, bind_addr: &str, bind_port_num: u16) -> Result<()> {
    let ip: IpAddr = tokio::net::lookup_host((bind_addr, bind_port_num))
        .await
        .map_err(|err| Error::Server(format!("cannot resolve {bind_addr}: {err}")))?
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| Error::Server(format!("{bind_addr} resolves to nothing")))?;

    let figment = rocket::Config::figment()
        .merge(("address", ip))
        .merge(("port", bind_port_num))
        .merge(("log_level", "off"))
        .merge(("cli_colors", false));

    info!(address = %ip, port = bind_port_num, "rpc server starting");
    build_rocket(node, figment)
        .launch()
        .await
        .map(|_| ())
        .map_err(|err| Error::Server(err.to_string()))
}

//
// client side
//

/// `PeerClient` over HTTP/JSON. Every call is bounded by the client timeout
/// and any transport or decoding failure is reported as `PeerUnreachable`.
pub struct HttpPeerClient {
    client: reqwest::Client,
}

impl HttpPeerClient {
    pub fn new(timeout: Duration) -> Result<HttpPeerClient> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(3)
            .timeout(timeout)
            .build()
            .map_err(|err| Error::Server(err.to_string()))?;
        Ok(HttpPeerClient { client })
    }

    async fn http_post_request<Req, Resp>(&self, address: &str, path: &str, body: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = format!("http://{address}/{path}");
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|err| Error::unreachable(address, err))?;
        let reply: Result<Resp> = resp
            .json()
            .await
            .map_err(|err| Error::unreachable(address, err))?;
        if let Err(err) = &reply {
            debug!(%url, %err, "peer answered with an error");
        }
        reply
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn health_check(&self, address: &str) -> Result<()> {
        self.http_post_request(address, "health_check", &()).await
    }

    async fn get_node_value(&self, address: &str, slot: Slot) -> Result<Option<NodeIdentity>> {
        self.http_post_request(address, "get_node_value", &GetNodeValueReq { slot }).await
    }

    async fn notify_node_changed(&self, address: &str, slot: Slot, node: NodeIdentity) -> Result<()> {
        self.http_post_request(address, "notify_node_changed", &NotifyNodeChangedReq { slot, node }).await
    }

    async fn toss_message(&self, address: &str, msg: TossMessage) -> Result<bool> {
        self.http_post_request(address, "toss_message", &msg).await
    }

    async fn handle_data(&self, address: &str, req: DataRequest) -> Result<DataReply> {
        self.http_post_request(address, "handle_data", &req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chord_util::RingKey;
    use crate::config::NodeConfig;
    use crate::rpc::DataOp;
    use crate::sim::SimNetwork;
    use rocket::http::{ContentType, Status};
    use rocket::local::asynchronous::Client;

    async fn local_client() -> (Arc<ChordNode>, Client) {
        let net = SimNetwork::new();
        let identity = NodeIdentity::new(RingKey::from_u64(10), "node-10");
        let node = ChordNode::with_identity(identity, NodeConfig::new("node-10"), net.clone());
        net.register(&node);
        let rocket = build_rocket(Arc::clone(&node), rocket::Config::figment().merge(("log_level", "off")));
        let client = Client::tracked(rocket).await.unwrap();
        (node, client)
    }

    #[tokio::test]
    async fn health_check_reports_leaving() {
        let (node, client) = local_client().await;
        let resp = client.post("/health_check").dispatch().await;
        assert_eq!(resp.status(), Status::Ok);
        let body: Result<()> = resp.into_json().await.unwrap();
        assert!(body.is_ok());

        node.set_leaving(true);
        let resp = client.post("/health_check").dispatch().await;
        let body: Result<()> = resp.into_json().await.unwrap();
        assert_eq!(body, Err(Error::Leaving));
    }

    #[tokio::test]
    async fn data_and_slot_routes_round_trip() {
        let (node, client) = local_client().await;
        let req = DataRequest::new(DataOp::Set, RingKey::from_u64(3), "three", Some("3".into()), node.identity.clone());
        let resp = client
            .post("/handle_data")
            .header(ContentType::JSON)
            .body(serde_json::to_string(&req).unwrap())
            .dispatch()
            .await;
        let body: Result<DataReply> = resp.into_json().await.unwrap();
        assert_eq!(body, Ok(DataReply::Stored));
        assert_eq!(node.store.get(&RingKey::from_u64(3)).unwrap().value, "3");

        let resp = client
            .post("/get_node_value")
            .header(ContentType::JSON)
            .body(serde_json::to_string(&GetNodeValueReq { slot: Slot::Finger(170) }).unwrap())
            .dispatch()
            .await;
        let body: Result<Option<NodeIdentity>> = resp.into_json().await.unwrap();
        assert!(matches!(body, Err(Error::ProtocolViolation(_))));
    }
}
