//! This example demonstrates concurrent reparenting in a tree container.
//! Two replicas each perform a move that is perfectly valid locally, but
//! applying both verbatim would bend the tree into a cycle. The merge
//! replays the tree's history in a canonical order and vetoes the move that
//! would close the cycle, so every replica ends with the same acyclic
//! forest.
use mvdoc::{Document, PeerId, crdts::TreeNode};
use std::error::Error;

fn print_forest(label: &str, nodes: &[TreeNode], depth: usize) {
    if depth == 0 {
        println!("{label}");
    }
    for node in nodes {
        let name = node
            .data
            .get("name")
            .map(|v| format!("{v:?}"))
            .unwrap_or_default();
        println!("   {}- {name}", "  ".repeat(depth));
        print_forest(label, &node.children, depth + 1);
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    // RUST_LOG=mvdoc=debug shows the merge driver's veto decisions
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // SETUP: alice builds a small outline and bob replicates it
    let mut alice = Document::new(PeerId::new(1));
    let (chapters, intro, details) = {
        let mut tree = alice.tree("outline")?;
        let chapters = tree.create(None)?;
        let intro = tree.create(Some(chapters))?;
        let details = tree.create(Some(chapters))?;
        tree.set(chapters, "name", "chapters")?;
        tree.set(intro, "name", "intro")?;
        tree.set(details, "name", "details")?;
        (chapters, intro, details)
    };
    let mut bob = Document::new(PeerId::new(2));
    bob.import_ops(&alice.export_ops(bob.version()))?;
    print_forest("1. Both replicas start from:", &alice.get_tree("outline").unwrap().forest(), 0);

    // CONCURRENT MOVES
    // Alice nests "details" under "intro"; Bob nests "intro" under
    // "details". Each is legal in isolation. Together they form a cycle.
    println!("2. Alice moves details under intro; Bob moves intro under details.");
    alice.tree("outline")?.mv(details, Some(intro))?;
    bob.tree("outline")?.mv(intro, Some(details))?;

    // A move that is *locally* visible as a cycle is rejected outright;
    // only cycles that no single replica could see reach the merge.
    assert!(alice.tree("outline")?.mv(chapters, Some(intro)).is_err());

    // MERGE
    println!("3. The replicas exchange operations.");
    let to_bob = alice.export_ops(bob.version());
    let to_alice = bob.export_ops(alice.version());
    alice.import_ops(&to_alice)?;
    bob.import_ops(&to_bob)?;

    // CONVERGED: one move committed, the other was vetoed, on both replicas
    let a = alice.get_tree("outline").unwrap();
    let b = bob.get_tree("outline").unwrap();
    assert_eq!(a, b);
    print_forest("4. Converged to:", &a.forest(), 0);

    for node in [chapters, intro, details] {
        assert!(!a.is_ancestor(node, node), "no node may become its own ancestor");
    }
    // exactly one of the two moves took effect
    let intro_under_details = a.parent(intro) == Some(mvdoc::crdts::tree::Parent::Node(details));
    let details_under_intro = a.parent(details) == Some(mvdoc::crdts::tree::Parent::Node(intro));
    assert!(intro_under_details ^ details_under_intro);

    Ok(())
}
