//! Reconstruction of tool calls from streamed fragments.

use std::collections::HashMap;

use crate::messages::unified::ToolCallFragment;

/// A tool call being assembled from fragments.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ToolCallState {
    pub id: String,
    pub name: String,
    /// Accumulated arguments.
    pub arguments: String,
    /// Content block of the call, assigned once its block start was emitted.
    pub block_index: Option<u32>,
    /// Length of `arguments` already emitted as deltas.
    sent_len: usize,
    placeholder_id: bool,
    placeholder_name: bool,
    /// Upstream fragment indices merged into this call.
    merged_indices: Vec<u32>,
}

impl ToolCallState {
    /// Arguments not emitted yet. Marks them as emitted.
    fn take_unsent(&mut self) -> Option<String> {
        if self.sent_len >= self.arguments.len() {
            return None;
        }

        let suffix = self.arguments[self.sent_len..].to_string();
        self.sent_len = self.arguments.len();

        Some(suffix)
    }
}

/// What applying a fragment did to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ToolCallUpdate {
    /// A new call was allocated.
    Opened(usize),
    /// The fragment was merged into an existing call.
    Appended(usize),
}

/// The tool calls of one stream.
///
/// Calls are keyed by the vendor's positional index. The id table only serves
/// to merge fragments a vendor sends under the same id but a different index.
#[derive(Debug, Default)]
pub(crate) struct ToolCallTable {
    calls: Vec<ToolCallState>,
    by_index: HashMap<u32, usize>,
    by_id: HashMap<String, usize>,
    placeholders: u64,
}

impl ToolCallTable {
    pub fn apply(&mut self, fragment: ToolCallFragment) -> ToolCallUpdate {
        let id = fragment.id.filter(|id| !id.is_empty());
        let name = fragment.name.filter(|name| !name.is_empty());

        let existing = self.by_index.get(&fragment.index).copied().or_else(|| {
            let slot = id.as_ref().and_then(|id| self.by_id.get(id)).copied()?;

            log::debug!(
                "Merging tool call fragment index {} into call {}",
                fragment.index,
                self.calls[slot].id
            );

            self.by_index.insert(fragment.index, slot);
            self.calls[slot].merged_indices.push(fragment.index);

            Some(slot)
        });

        let update = match existing {
            Some(slot) => {
                let call = &mut self.calls[slot];

                if let Some(id) = id
                    && call.placeholder_id
                {
                    call.id = id.clone();
                    call.placeholder_id = false;
                    self.by_id.entry(id).or_insert(slot);
                }

                if let Some(name) = name
                    && call.placeholder_name
                {
                    call.name = name;
                    call.placeholder_name = false;
                }

                ToolCallUpdate::Appended(slot)
            }
            None => {
                let slot = self.calls.len();

                let (id, placeholder_id) = match id {
                    Some(id) => {
                        self.by_id.entry(id.clone()).or_insert(slot);
                        (id, false)
                    }
                    None => {
                        self.placeholders += 1;
                        (format!("call_{}", self.placeholders), true)
                    }
                };

                let (name, placeholder_name) = match name {
                    Some(name) => (name, false),
                    None => (format!("tool_{}", fragment.index), true),
                };

                self.calls.push(ToolCallState {
                    id,
                    name,
                    arguments: String::new(),
                    block_index: None,
                    sent_len: 0,
                    placeholder_id,
                    placeholder_name,
                    merged_indices: vec![fragment.index],
                });

                self.by_index.insert(fragment.index, slot);

                ToolCallUpdate::Opened(slot)
            }
        };

        let slot = match update {
            ToolCallUpdate::Opened(slot) | ToolCallUpdate::Appended(slot) => slot,
        };

        if let Some(arguments) = fragment.arguments {
            self.calls[slot].arguments.push_str(&arguments);
        }

        update
    }

    pub fn get(&self, slot: usize) -> &ToolCallState {
        &self.calls[slot]
    }

    pub fn assign_block(&mut self, slot: usize, block_index: u32) {
        self.calls[slot].block_index = Some(block_index);
    }

    /// Arguments of the call not emitted yet, marked as emitted.
    pub fn take_unsent(&mut self, slot: usize) -> Option<String> {
        self.calls[slot].take_unsent()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolCallState> {
        self.calls.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(index: u32, id: Option<&str>, name: Option<&str>, arguments: Option<&str>) -> ToolCallFragment {
        ToolCallFragment {
            index,
            id: id.map(str::to_string),
            name: name.map(str::to_string),
            arguments: arguments.map(str::to_string),
        }
    }

    #[test]
    fn placeholders_are_adopted_silently() {
        let mut table = ToolCallTable::default();

        let update = table.apply(fragment(2, None, None, Some("{")));
        assert_eq!(update, ToolCallUpdate::Opened(0));
        assert_eq!(table.get(0).id, "call_1");
        assert_eq!(table.get(0).name, "tool_2");

        let update = table.apply(fragment(2, Some("toolu_9"), Some("search"), Some("}")));
        assert_eq!(update, ToolCallUpdate::Appended(0));

        let call = table.get(0);
        assert_eq!(call.id, "toolu_9");
        assert_eq!(call.name, "search");
        assert_eq!(call.arguments, "{}");
    }

    #[test]
    fn real_ids_are_never_replaced() {
        let mut table = ToolCallTable::default();

        table.apply(fragment(0, Some("abc"), Some("get_weather"), None));
        table.apply(fragment(0, Some("other"), Some("other_name"), None));

        assert_eq!(table.get(0).id, "abc");
        assert_eq!(table.get(0).name, "get_weather");
    }

    #[test]
    fn same_id_under_another_index_is_merged() {
        let mut table = ToolCallTable::default();

        table.apply(fragment(0, Some("abc"), Some("get_weather"), Some("{\"city\":")));
        let update = table.apply(fragment(1, Some("abc"), None, Some("\"NYC\"}")));
        assert_eq!(update, ToolCallUpdate::Appended(0));

        // later fragments on the merged index land in the same call
        let update = table.apply(fragment(1, None, None, Some(" ")));
        assert_eq!(update, ToolCallUpdate::Appended(0));

        assert_eq!(table.get(0).arguments, "{\"city\":\"NYC\"} ");
        assert_eq!(table.get(0).merged_indices, [0, 1]);
        assert_eq!(table.iter().count(), 1);
    }

    #[test]
    fn unsent_suffix_concatenates_to_the_arguments() {
        let mut table = ToolCallTable::default();
        let pieces = ["", "{\"q\"", ":", "", "\"rust\"", "}"];
        let mut emitted = String::new();

        for piece in pieces {
            table.apply(fragment(0, Some("call"), Some("search"), Some(piece)));

            if let Some(suffix) = table.take_unsent(0) {
                assert!(!suffix.is_empty());
                emitted.push_str(&suffix);
            }
        }

        assert_eq!(emitted, table.get(0).arguments);
        assert_eq!(table.take_unsent(0), None);
    }

    #[test]
    fn placeholder_counter_is_per_table() {
        let mut first = ToolCallTable::default();
        let mut second = ToolCallTable::default();

        first.apply(fragment(0, None, Some("a"), None));
        first.apply(fragment(1, None, Some("b"), None));
        second.apply(fragment(0, None, Some("c"), None));

        assert_eq!(first.get(1).id, "call_2");
        assert_eq!(second.get(0).id, "call_1");
    }
}
