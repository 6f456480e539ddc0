//! In-process leaf nodes for dqnet: data sources that answer one fact, and
//! request originators that issue a single query and wait for its answer.
//!
//! Both talk to a solver over an [`Endpoint`] obtained from
//! `Solver::attach_source` or `Solver::attach_request`.

use dqnet_core::{match_fact, Atom, Bindings, ParseError};
use dqnet_swarm::{Endpoint, NodeId, Packet, PacketKind, SwarmError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// A data source holding a single ground fact.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Source {
    id: NodeId,
    fact: Atom,
}

impl Source {
    pub fn new(id: NodeId, fact: Atom) -> Self {
        Self { id, fact }
    }

    /// Builds a source from fact text such as `location("Westwood").`
    pub fn parse(id: NodeId, fact: &str) -> Result<Self, ParseError> {
        Ok(Self::new(id, Atom::parse(fact)?))
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn fact(&self) -> &Atom {
        &self.fact
    }

    /// Predicate key this source serves, e.g. `location/1`.
    pub fn key(&self) -> String {
        self.fact.key()
    }

    /// Answers a request packet against the fact.
    ///
    /// Returns `None` for anything that is not a request. A query that does
    /// not match the fact gets an explicit no-match response.
    pub fn answer(&self, packet: &Packet) -> Option<Packet> {
        if packet.kind != PacketKind::Request {
            return None;
        }
        let reply = match match_fact(&packet.query, &self.fact).into_bindings() {
            Some(bindings) => Packet::response(packet.query.clone(), bindings),
            None => Packet::no_match(packet.query.clone()),
        };
        Some(reply)
    }

    /// Serves requests until the link closes.
    pub async fn run(self, mut endpoint: Endpoint) {
        while let Some(packet) = endpoint.recv().await {
            let Some(reply) = self.answer(&packet) else {
                debug!(source = %self.id, packet = %packet, "ignoring non-request packet");
                continue;
            };
            debug!(source = %self.id, reply = %reply, "answering request");
            if let Err(err) = endpoint.send(reply).await {
                warn!(source = %self.id, %err, "source link closed");
                return;
            }
        }
        debug!(source = %self.id, "source link closed");
    }
}

/// Final outcome of a request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "bindings", rename_all = "snake_case")]
pub enum Answer {
    Bound(Bindings),
    NoMatch,
}

/// A requester that issues one query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    id: NodeId,
    query: Atom,
}

impl Request {
    pub fn new(id: NodeId, query: Atom) -> Self {
        Self { id, query }
    }

    pub fn parse(id: NodeId, query: &str) -> Result<Self, ParseError> {
        Ok(Self::new(id, Atom::parse(query)?))
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn query(&self) -> &Atom {
        &self.query
    }

    /// Sends the query and waits for the first response.
    ///
    /// A solver that cannot route the query never answers; callers bound the
    /// wait themselves.
    pub async fn run(self, mut endpoint: Endpoint) -> Result<Answer, SwarmError> {
        endpoint.send(Packet::request(self.query.clone())).await?;
        loop {
            let Some(packet) = endpoint.recv().await else {
                return Err(SwarmError::ChannelClosed(endpoint.peer.clone()));
            };
            if packet.kind != PacketKind::Response {
                debug!(request = %self.id, packet = %packet, "ignoring non-response packet");
                continue;
            }
            info!(request = %self.id, answer = %packet, "request answered");
            return Ok(match packet.result {
                Some(bindings) => Answer::Bound(bindings),
                None => Answer::NoMatch,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dqnet_swarm::link;

    fn atom(text: &str) -> Atom {
        Atom::parse(text).unwrap()
    }

    #[test]
    fn source_binds_query_variables() {
        let source = Source::parse(NodeId::new("d1"), "location(\"Westwood\").").unwrap();
        assert_eq!(source.key(), "location/1");

        let reply = source
            .answer(&Packet::request(atom("location(?L)")))
            .unwrap();
        let mut expected = Bindings::new();
        expected.insert("?L".into(), "Westwood".into());
        assert_eq!(reply, Packet::response(atom("location(?L)"), expected));
    }

    #[test]
    fn source_reports_no_match() {
        let source = Source::parse(NodeId::new("d1"), "location(Westwood)").unwrap();
        let reply = source
            .answer(&Packet::request(atom("location(Brentwood)")))
            .unwrap();
        assert_eq!(reply, Packet::no_match(atom("location(Brentwood)")));

        let wrong_arity = source
            .answer(&Packet::request(atom("location(?A, ?B)")))
            .unwrap();
        assert_eq!(wrong_arity.result, None);
    }

    #[test]
    fn source_ignores_non_requests() {
        let source = Source::parse(NodeId::new("d1"), "location(Westwood)").unwrap();
        assert!(source
            .answer(&Packet::no_match(atom("location(?L)")))
            .is_none());
        assert!(source
            .answer(&Packet::announce("location/1", &NodeId::new("s1"), 0))
            .is_none());
    }

    #[test]
    fn answer_serializes_with_status_tag() {
        let mut bindings = Bindings::new();
        bindings.insert("?X".into(), "Westwood".into());
        let json = serde_json::to_value(Answer::Bound(bindings)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"status": "bound", "bindings": {"?X": "Westwood"}})
        );
        let json = serde_json::to_value(Answer::NoMatch).unwrap();
        assert_eq!(json, serde_json::json!({"status": "no_match"}));
    }

    #[tokio::test]
    async fn request_and_source_talk_over_a_link() {
        let (request_end, source_end) = link(&NodeId::new("r1"), &NodeId::new("d1"), 4);
        let source = Source::parse(NodeId::new("d1"), "price(\"$5\")").unwrap();
        let serving = tokio::spawn(source.run(source_end));

        let request = Request::parse(NodeId::new("r1"), "price(?P)").unwrap();
        let answer = request.run(request_end).await.unwrap();
        let mut expected = Bindings::new();
        expected.insert("?P".into(), "$5".into());
        assert_eq!(answer, Answer::Bound(expected));

        serving.await.unwrap();
    }

    #[tokio::test]
    async fn request_fails_when_link_closes() {
        let (request_end, solver_end) = link(&NodeId::new("r1"), &NodeId::new("s1"), 4);
        drop(solver_end);
        let request = Request::parse(NodeId::new("r1"), "price(?P)").unwrap();
        let err = request.run(request_end).await.unwrap_err();
        assert!(matches!(err, SwarmError::ChannelClosed(peer) if peer == NodeId::new("s1")));
    }
}
