//! This example demonstrates how mvdoc resolves concurrent edits to a
//! movable list. Two replicas of a shopping list move, rewrite, and delete
//! the same elements without coordinating, then exchange their operation
//! logs and converge on a single sequence in which nothing is duplicated
//! and nothing is lost.
use mvdoc::{Document, PeerId};
use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    // SETUP: TWO REPLICAS
    let mut alice = Document::new(PeerId::new(1));
    let mut bob = Document::new(PeerId::new(2));

    // INITIAL STATE on alice's replica
    println!("1. Alice creates the shopping list.");
    {
        let mut items = alice.list("items")?;
        for value in ["bread", "milk", "cheese", "apples"] {
            items.push(value)?;
        }
    }

    // SYNC: bob receives everything he has not seen yet
    println!("2. Bob syncs with Alice.");
    bob.import_ops(&alice.export_ops(bob.version()))?;
    println!("   Both see: {:?}", bob.get_list("items").unwrap().values());

    // CONCURRENT EDITS
    // The replicas now edit without talking to each other. Every edit
    // addresses an element's stable identity, so "cheese" stays "cheese"
    // no matter where concurrent moves put it.
    println!("3. Concurrently: Alice moves cheese to the front and deletes milk...");
    alice.list("items")?.mv(2, 0)?;
    alice.list("items")?.delete_at(2)?;

    println!("   ...while Bob moves cheese to the back and renames bread.");
    bob.list("items")?.mv(2, 3)?;
    bob.list("items")?.set_at(0, "rye bread")?;

    // MERGE: exchange both directions
    println!("4. The replicas exchange their operation logs.");
    let to_bob = alice.export_ops(bob.version());
    let to_alice = bob.export_ops(alice.version());
    alice.import_ops(&to_alice)?;
    bob.import_ops(&to_bob)?;

    // CONVERGED
    let a = alice.get_list("items").unwrap().values();
    let b = bob.get_list("items").unwrap().values();
    assert_eq!(a, b);
    println!("5. Converged: {a:?}");

    // The two moves raced for cheese's position register; one of them won
    // on both replicas, and cheese appears exactly once.
    assert_eq!(a.iter().filter(|v| **v == "cheese").count(), 1);
    // The delete won over any concurrent edit of milk.
    assert!(a.iter().all(|v| **v != "milk"));
    // Bob's rename is visible, at whatever position bread ended up.
    assert!(a.iter().any(|v| **v == "rye bread"));

    Ok(())
}
