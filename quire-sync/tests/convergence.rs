//! Property-based tests for the operation codec and the server rebase path.

use proptest::prelude::*;
use quire_sync::client::ClientDocument;
use quire_sync::delta::{attrs, transform, AttrValue, Delta};
use quire_sync::document::{Document, DocumentId, History, Snapshot};

/// One step of a randomly generated delta, fitted to a document later.
#[derive(Clone, Debug)]
enum Step {
    Retain { len: usize, bold: Option<bool> },
    Insert { text: String, bold: bool },
    Delete { len: usize },
}

fn arbitrary_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (1..6usize, prop::option::of(any::<bool>()))
            .prop_map(|(len, bold)| Step::Retain { len, bold }),
        ("[a-z]{1,5}", any::<bool>()).prop_map(|(text, bold)| Step::Insert { text, bold }),
        (1..4usize).prop_map(|len| Step::Delete { len }),
    ]
}

fn arbitrary_document() -> impl Strategy<Value = Delta> {
    prop::collection::vec(("[a-z ]{1,6}", any::<bool>()), 0..5).prop_map(|runs| {
        runs.into_iter().fold(Delta::new(), |doc, (text, bold)| {
            if bold {
                doc.insert_with(text, attrs([("bold", true)]))
            } else {
                doc.insert(text)
            }
        })
    })
}

/// Build a delta from `steps` that never walks past `len` characters.
fn fit(steps: &[Step], len: usize) -> Delta {
    let mut remaining = len;
    let mut delta = Delta::new();
    for step in steps {
        delta = match step {
            Step::Retain { len, bold } => {
                let n = (*len).min(remaining);
                remaining -= n;
                match bold {
                    Some(true) => delta.retain_with(n, attrs([("bold", true)])),
                    Some(false) => delta.retain_with(n, attrs([("bold", AttrValue::Null)])),
                    None => delta.retain(n),
                }
            }
            Step::Insert { text, bold } => {
                if *bold {
                    delta.insert_with(text.clone(), attrs([("bold", true)]))
                } else {
                    delta.insert(text.clone())
                }
            }
            Step::Delete { len } => {
                let n = (*len).min(remaining);
                remaining -= n;
                delta.delete(n)
            }
        };
    }
    delta
}

fn steps() -> impl Strategy<Value = Vec<Step>> {
    prop::collection::vec(arbitrary_step(), 0..8)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// Applying `b` then `a'` equals applying `a` then `b'`.
    #[test]
    fn concurrent_edits_converge(doc in arbitrary_document(), a in steps(), b in steps()) {
        let a = fit(&a, doc.len());
        let b = fit(&b, doc.len());
        let (a_prime, b_prime) = transform(&a, &b);

        let via_a = b_prime.apply(&a.apply(&doc).unwrap()).unwrap();
        let via_b = a_prime.apply(&b.apply(&doc).unwrap()).unwrap();
        prop_assert_eq!(via_a, via_b);
    }

    /// `a.compose(b)` has the effect of `a` followed by `b`.
    #[test]
    fn compose_matches_sequential_apply(doc in arbitrary_document(), a in steps(), b in steps()) {
        let a = fit(&a, doc.len());
        let after_a = a.apply(&doc).unwrap();
        let b = fit(&b, after_a.len());

        let sequential = b.apply(&after_a).unwrap();
        let composed = a.compose(&b).apply(&doc).unwrap();
        prop_assert_eq!(sequential, composed);
    }

    /// The inverse restores the original document.
    #[test]
    fn invert_restores_document(doc in arbitrary_document(), a in steps()) {
        let a = fit(&a, doc.len());
        let inverse = a.invert(&doc);
        let restored = inverse.apply(&a.apply(&doc).unwrap()).unwrap();
        prop_assert_eq!(restored, doc);
    }

    /// Clients that submit concurrently from one base, then receive every
    /// commit in server order, end up with the server's content.
    #[test]
    fn clients_converge_with_server(
        doc in arbitrary_document(),
        edits in prop::collection::vec(steps(), 1..5),
    ) {
        let snapshot = Snapshot { content: doc.clone(), version: 7 };
        let mut server = Document::from_snapshot(DocumentId::from("prop"), snapshot.clone());
        let mut history = History::new(64);
        let mut clients: Vec<ClientDocument> = edits
            .iter()
            .map(|_| ClientDocument::from_snapshot(snapshot.clone()))
            .collect();

        let mut submissions = Vec::new();
        for (client, steps) in clients.iter_mut().zip(&edits) {
            let op = fit(steps, doc.len());
            let sent = client.apply_local(op).unwrap();
            submissions.push(sent.unwrap());
        }

        for (origin, (base, op)) in submissions.into_iter().enumerate() {
            let rebased = history.rebase(base, server.version(), op).unwrap();
            let commit = server.apply(rebased).unwrap();
            history.push(commit.clone());
            for (i, client) in clients.iter_mut().enumerate() {
                if i == origin {
                    prop_assert_eq!(client.acknowledge(commit.version), None);
                } else {
                    client.apply_remote(commit.delta.clone(), commit.version).unwrap();
                }
            }
        }

        for client in &clients {
            prop_assert_eq!(client.content(), server.content());
            prop_assert_eq!(client.version(), server.version());
        }
    }
}
