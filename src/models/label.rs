use serde::{Deserialize, Serialize};

use super::job::Identifier;

/// Label assigned when a provider could not place an image, or its chunk failed.
pub const NONE_LABEL: &str = "NONE";

/// One label with the ids assigned to it, in assignment order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelGroup {
    pub label: String,
    pub ids: Vec<Identifier>,
}

/// Insertion-ordered label to ids mapping. Serializes as `[{label, ids}]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelToIds(Vec<LabelGroup>);

impl LabelToIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `id` under `label`, creating the label at the end if unseen.
    pub fn insert(&mut self, label: &str, id: Identifier) {
        match self.0.iter_mut().find(|g| g.label == label) {
            Some(group) => group.ids.push(id),
            None => self.0.push(LabelGroup {
                label: label.to_string(),
                ids: vec![id],
            }),
        }
    }

    pub fn get(&self, label: &str) -> Option<&[Identifier]> {
        self.0
            .iter()
            .find(|g| g.label == label)
            .map(|g| g.ids.as_slice())
    }

    pub fn groups(&self) -> &[LabelGroup] {
        &self.0
    }

    /// Total ids across all labels.
    pub fn total_ids(&self) -> usize {
        self.0.iter().map(|g| g.ids.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_keeps_first_seen_order() {
        let mut map = LabelToIds::new();
        map.insert("dog", 1.into());
        map.insert("cat", 2.into());
        map.insert("dog", 3.into());

        let order: Vec<&str> = map.groups().iter().map(|g| g.label.as_str()).collect();
        assert_eq!(order, vec!["dog", "cat"]);
        assert_eq!(map.get("dog"), Some(&[Identifier::Num(1), Identifier::Num(3)][..]));
        assert_eq!(map.total_ids(), 3);
    }

    #[test]
    fn test_serializes_as_group_list() {
        let mut map = LabelToIds::new();
        map.insert(NONE_LABEL, "a".into());
        let json = serde_json::to_value(&map).unwrap();
        assert_eq!(json, serde_json::json!([{"label": "NONE", "ids": ["a"]}]));
    }
}
