//! Materializing documents as [`serde_json::Value`].
//!
//! The snapshot contains only visible state: tombstones, losing register
//! values, and vetoed moves have no representation. Two replicas that hold
//! the same operation set therefore produce byte-identical JSON.
use crate::{
    Document,
    crdts::{ScalarValue, TreeNode},
    document::Container,
};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde_json::{Map, Value};

impl Document {
    /// Renders the current visible state of every container.
    ///
    /// Lists become arrays, maps become objects, texts become strings, and
    /// trees become arrays of `{"id", "data", "children"}` objects. Byte
    /// values are base64-encoded, since JSON has no binary type.
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.containers
                .iter()
                .map(|(name, container)| (name.clone(), container_json(container)))
                .collect(),
        )
    }
}

fn container_json(container: &Container) -> Value {
    match container {
        Container::List(list) => Value::Array(list.values().into_iter().map(scalar_json).collect()),
        Container::Tree(tree) => Value::Array(tree.forest().iter().map(node_json).collect()),
        Container::Map(map) => Value::Object(
            map.iter()
                .map(|(key, value)| (key.to_string(), scalar_json(value)))
                .collect(),
        ),
        Container::Text(text) => Value::String(text.to_string()),
    }
}

fn node_json(node: &TreeNode) -> Value {
    let mut object = Map::new();
    let id = node.id.op();
    object.insert(
        "id".to_string(),
        Value::String(format!("{}:{}", id.peer(), id.counter())),
    );
    object.insert(
        "data".to_string(),
        Value::Object(
            node.data
                .iter()
                .map(|(key, value)| (key.clone(), scalar_json(value)))
                .collect(),
        ),
    );
    object.insert(
        "children".to_string(),
        Value::Array(node.children.iter().map(node_json).collect()),
    );
    Value::Object(object)
}

fn scalar_json(value: &ScalarValue) -> Value {
    match value {
        ScalarValue::Bytes(bytes) => Value::String(BASE64.encode(bytes)),
        ScalarValue::String(s) => Value::String(s.clone()),
        ScalarValue::Double(d) => Value::from(*d),
        ScalarValue::U64(u) => Value::from(*u),
        ScalarValue::I64(i) => Value::from(*i),
        ScalarValue::Bool(b) => Value::Bool(*b),
    }
}

#[cfg(test)]
mod tests {
    use crate::{Document, PeerId};
    use serde_json::json;

    #[test]
    fn snapshot_renders_every_container_kind() {
        let mut doc = Document::new(PeerId::new(1));
        let mut items = doc.list("items").unwrap();
        items.push("bread").unwrap();
        items.push(2u64).unwrap();
        let mut meta = doc.map("meta").unwrap();
        meta.set("title", "groceries");
        meta.set("draft", true);
        meta.remove("draft");
        doc.text("note").unwrap().push_str("pick up at 5").unwrap();
        let mut nodes = doc.tree("outline").unwrap();
        let root = nodes.create(None).unwrap();
        nodes.create(Some(root)).unwrap();
        nodes.set(root, "label", "intro").unwrap();

        assert_eq!(
            doc.to_json(),
            json!({
                "items": ["bread", 2],
                "meta": {"title": "groceries"},
                "note": "pick up at 5",
                // the tree creations are ops 18 and 19 of peer 1
                "outline": [{
                    "id": "1:18",
                    "data": {"label": "intro"},
                    "children": [{"id": "1:19", "data": {}, "children": []}],
                }],
            }),
        );
    }

    #[test]
    fn converged_replicas_snapshot_identically() {
        let mut alice = Document::new(PeerId::new(1));
        let mut bob = Document::new(PeerId::new(2));
        alice.list("items").unwrap().push("a").unwrap();
        bob.map("meta").unwrap().set("k", "v");

        bob.import_ops(&alice.export_ops(bob.version())).unwrap();
        alice.import_ops(&bob.export_ops(alice.version())).unwrap();
        assert_eq!(alice.to_json(), bob.to_json());
    }
}
