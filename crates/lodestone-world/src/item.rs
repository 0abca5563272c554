//! Item stacks carried in inventories and dropped into the world.

use serde::{Deserialize, Serialize};

/// A stack of identical items.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemStack {
    /// Registry name of the item (e.g. `"cobblestone"`).
    pub item: String,
    /// Number of items in the stack. Never zero for a stored stack.
    pub count: u8,
}

impl ItemStack {
    /// Largest count a single stack may hold.
    pub const MAX_COUNT: u8 = 64;

    pub fn new(item: impl Into<String>, count: u8) -> Self {
        Self {
            item: item.into(),
            count,
        }
    }

    /// Whether the stack holds nothing.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}
