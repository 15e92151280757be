use crate::{error::Result, model::ChangeEvent};
use std::collections::HashMap;

/// 同一主键的一组变更（保持到达顺序）
#[derive(Debug)]
pub struct KeyGroup<'a> {
    pub serialized_keys: String,
    pub events: Vec<&'a ChangeEvent>,
}

/// 按主键分组
///
/// 组内保持事件的到达顺序，组之间按主键第一次出现的顺序排列。
pub fn group_by_keys(events: &[ChangeEvent]) -> Result<Vec<KeyGroup<'_>>> {
    let mut groups: Vec<KeyGroup<'_>> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for event in events {
        let serialized = event.serialized_keys()?;
        match index.get(&serialized) {
            Some(&position) => groups[position].events.push(event),
            None => {
                index.insert(serialized.clone(), groups.len());
                groups.push(KeyGroup {
                    serialized_keys: serialized,
                    events: vec![event],
                });
            }
        }
    }

    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttributeValue, EventKind, KeyMap};

    fn event(id: &str, kind: EventKind, version: u32) -> ChangeEvent {
        let mut keys = KeyMap::new();
        keys.insert("id".to_string(), AttributeValue::S(id.to_string()));
        let mut image = keys.clone();
        image.insert("v".to_string(), AttributeValue::N(version.to_string()));
        ChangeEvent {
            keys,
            kind,
            new_image: (kind != EventKind::Remove).then_some(image),
            source_partition: "shard-1".to_string(),
        }
    }

    fn version_of(event: &ChangeEvent) -> Option<&AttributeValue> {
        event.new_image.as_ref().and_then(|image| image.get("v"))
    }

    #[test]
    fn test_groups_keep_first_seen_and_arrival_order() {
        let events = vec![
            event("b", EventKind::Insert, 1),
            event("a", EventKind::Insert, 1),
            event("b", EventKind::Modify, 2),
            event("a", EventKind::Remove, 0),
            event("b", EventKind::Modify, 3),
        ];

        let groups = group_by_keys(&events).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].serialized_keys, r#"{"id":{"S":"b"}}"#);
        assert_eq!(groups[1].serialized_keys, r#"{"id":{"S":"a"}}"#);

        let b_versions: Vec<_> = groups[0].events.iter().filter_map(|e| version_of(e)).cloned().collect();
        assert_eq!(
            b_versions,
            vec![
                AttributeValue::N("1".to_string()),
                AttributeValue::N("2".to_string()),
                AttributeValue::N("3".to_string())
            ]
        );
        let a_kinds: Vec<_> = groups[1].events.iter().map(|e| e.kind).collect();
        assert_eq!(a_kinds, vec![EventKind::Insert, EventKind::Remove]);
    }

    #[test]
    fn test_empty_input_has_no_groups() {
        assert!(group_by_keys(&[]).unwrap().is_empty());
    }
}
