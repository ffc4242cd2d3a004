//! Interaction graph projection.
//!
//! Pure function from a snapshot of posts to a node/edge list describing who
//! replies to, quotes, and mentions whom. Nodes are keyed by DID; there is no
//! shared ownership, the projection borrows nothing from the input.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::id::{Did, Handle, PostUri};
use crate::post::Post;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphNode {
    pub id: Did,
    /// Known handle, if any post in the snapshot was authored by this DID.
    pub handle: Option<Handle>,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    Reply,
    Quote,
    Mention,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphEdge {
    pub from: Did,
    pub to: Did,
    pub kind: EdgeKind,
    /// The post that created the edge.
    pub via: PostUri,
}

/// Projects reply/quote/mention edges out of a post snapshot.
///
/// Nodes cover every DID seen on either end of an edge plus every author.
/// Output is deterministic: nodes sorted by DID, edges in input post order.
pub fn interaction_graph(posts: &[Post]) -> (Vec<GraphNode>, Vec<GraphEdge>) {
    let mut nodes: BTreeMap<Did, Option<Handle>> = BTreeMap::new();
    let mut edges = Vec::new();

    for post in posts {
        nodes
            .entry(post.author_did.clone())
            .and_modify(|h| {
                if h.is_none() {
                    *h = Some(post.author.clone());
                }
            })
            .or_insert_with(|| Some(post.author.clone()));

        if let Some(reply) = &post.reply {
            let to = reply.parent.uri.authority();
            nodes.entry(to.clone()).or_default();
            edges.push(GraphEdge {
                from: post.author_did.clone(),
                to,
                kind: EdgeKind::Reply,
                via: post.uri.clone(),
            });
        }

        if let Some(record) = post.quoted_record() {
            let to = record.uri.authority();
            nodes.entry(to.clone()).or_default();
            edges.push(GraphEdge {
                from: post.author_did.clone(),
                to,
                kind: EdgeKind::Quote,
                via: post.uri.clone(),
            });
        }

        for mentioned in &post.mentions {
            nodes.entry(mentioned.clone()).or_default();
            edges.push(GraphEdge {
                from: post.author_did.clone(),
                to: mentioned.clone(),
                kind: EdgeKind::Mention,
                via: post.uri.clone(),
            });
        }
    }

    let nodes = nodes
        .into_iter()
        .map(|(id, handle)| GraphNode { id, handle })
        .collect();
    (nodes, edges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::post::{Embed, PostRef, RecordEmbed, ReplyRef};

    fn post(rkey: &str, author: &str) -> Post {
        Post {
            uri: format!("at://did:plc:{author}/app.bsky.feed.post/{rkey}")
                .parse()
                .unwrap(),
            cid: "bafyreib2rxk3rh6kzwq".parse().unwrap(),
            author: format!("{author}.test").parse().unwrap(),
            author_did: format!("did:plc:{author}").parse().unwrap(),
            text: String::new(),
            created_at: "2024-06-01T10:00:00Z".parse().unwrap(),
            hashtags: Default::default(),
            mentions: Default::default(),
            links: Default::default(),
            embed: None,
            reply: None,
            reason: None,
            metrics: None,
            langs: None,
        }
    }

    #[test]
    fn projects_reply_quote_and_mention_edges() {
        let mut reply = post("3kreply", "alice");
        let parent_ref = PostRef {
            uri: "at://did:plc:bob/app.bsky.feed.post/3kparent".parse().unwrap(),
            cid: "bafyreib2rxk3rh6kzwa".parse().unwrap(),
        };
        reply.reply = Some(ReplyRef {
            root: parent_ref.clone(),
            parent: parent_ref,
        });

        let mut quote = post("3kquote", "carol");
        quote.embed = Some(Embed::Record {
            record: RecordEmbed {
                uri: "at://did:plc:alice/app.bsky.feed.post/3kreply"
                    .parse()
                    .unwrap(),
                cid: "bafyreib2rxk3rh6kzwb".parse().unwrap(),
            },
        });
        quote.mentions.insert("did:plc:dave".parse().unwrap());

        let (nodes, edges) = interaction_graph(&[reply, quote]);

        let ids: Vec<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(
            ids,
            [
                "did:plc:alice",
                "did:plc:bob",
                "did:plc:carol",
                "did:plc:dave"
            ]
        );
        // bob and dave never authored anything in the snapshot
        assert!(nodes[1].handle.is_none());
        assert!(nodes[3].handle.is_none());

        let kinds: Vec<EdgeKind> = edges.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, [EdgeKind::Reply, EdgeKind::Quote, EdgeKind::Mention]);
        assert_eq!(edges[1].from.as_str(), "did:plc:carol");
        assert_eq!(edges[1].to.as_str(), "did:plc:alice");
    }

    #[test]
    fn empty_snapshot_is_empty_graph() {
        let (nodes, edges) = interaction_graph(&[]);
        assert!(nodes.is_empty());
        assert!(edges.is_empty());
    }
}
