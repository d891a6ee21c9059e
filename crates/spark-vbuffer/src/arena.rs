//! 带代际计数的槽位竞技场，承载段与已注册迭代器。
//!
//! # 设计背景（Why）
//! - 段链与迭代器之间是双向引用：段需要枚举挂在自身上的迭代器，迭代器需要定位所属段。
//!   以裸指针表达会产生别名与悬垂问题，因此两者都存放在竞技场中，以键互相引用；
//! - 槽位被复用时代际计数递增，旧键查询返回 `None`，从而把“使用已销毁段”转化为可检测的错误。
//!
//! # 契约说明（What）
//! - `insert` 在槽位数超出 `u32` 表达范围时返回 `None`，由调用方转换为资源耗尽错误；
//! - `get`/`get_mut`/`remove` 对过期键返回 `None`；
//! - `Index`/`IndexMut` 仅供内部在不变量已成立的路径上使用，过期键会触发 panic。

use core::fmt;
use core::ops::{Index, IndexMut};

/// 竞技场键：槽位下标 + 代际计数。
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArenaKey {
    slot: u32,
    generation: u32,
}

impl ArenaKey {
    /// 返回槽位下标。
    pub const fn slot(self) -> u32 {
        self.slot
    }

    /// 返回代际计数。
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for ArenaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.slot(), self.generation())
    }
}

#[derive(Debug)]
enum Entry<T> {
    Occupied { value: T, generation: u32 },
    Vacant { next_free: Option<u32>, generation: u32 },
}

#[derive(Debug)]
pub(crate) struct Arena<T> {
    entries: Vec<Entry<T>>,
    free_head: Option<u32>,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    pub(crate) const fn new() -> Self {
        Self {
            entries: Vec::new(),
            free_head: None,
            len: 0,
        }
    }

    pub(crate) const fn len(&self) -> usize {
        self.len
    }

    /// 放入新值；复用空闲槽位时沿用其已递增的代际。
    pub(crate) fn insert(&mut self, value: T) -> Option<ArenaKey> {
        if let Some(slot) = self.free_head {
            let entry = &mut self.entries[slot as usize];
            let Entry::Vacant {
                next_free,
                generation,
            } = *entry
            else {
                unreachable!("free list points at an occupied entry");
            };
            self.free_head = next_free;
            *entry = Entry::Occupied { value, generation };
            self.len += 1;
            return Some(ArenaKey { slot, generation });
        }
        let slot = u32::try_from(self.entries.len()).ok()?;
        if slot == u32::MAX {
            return None;
        }
        self.entries.push(Entry::Occupied {
            value,
            generation: 0,
        });
        self.len += 1;
        Some(ArenaKey {
            slot,
            generation: 0,
        })
    }

    pub(crate) fn remove(&mut self, key: ArenaKey) -> Option<T> {
        let entry = self.entries.get_mut(key.slot as usize)?;
        match entry {
            Entry::Occupied { generation, .. } if *generation == key.generation => {
                let vacant = Entry::Vacant {
                    next_free: self.free_head,
                    generation: generation.wrapping_add(1),
                };
                let Entry::Occupied { value, .. } = core::mem::replace(entry, vacant) else {
                    unreachable!("entry checked as occupied");
                };
                self.free_head = Some(key.slot);
                self.len -= 1;
                Some(value)
            }
            _ => None,
        }
    }

    pub(crate) fn get(&self, key: ArenaKey) -> Option<&T> {
        match self.entries.get(key.slot as usize)? {
            Entry::Occupied { value, generation } if *generation == key.generation => Some(value),
            _ => None,
        }
    }

    pub(crate) fn get_mut(&mut self, key: ArenaKey) -> Option<&mut T> {
        match self.entries.get_mut(key.slot as usize)? {
            Entry::Occupied { value, generation } if *generation == key.generation => Some(value),
            _ => None,
        }
    }

    pub(crate) fn contains(&self, key: ArenaKey) -> bool {
        self.get(key).is_some()
    }

    /// 清空全部条目并返回其中的值，键随之全部失效。
    pub(crate) fn drain(&mut self) -> Vec<T> {
        let entries = core::mem::take(&mut self.entries);
        self.free_head = None;
        self.len = 0;
        entries
            .into_iter()
            .filter_map(|entry| match entry {
                Entry::Occupied { value, .. } => Some(value),
                Entry::Vacant { .. } => None,
            })
            .collect()
    }
}

impl<T> Index<ArenaKey> for Arena<T> {
    type Output = T;

    fn index(&self, key: ArenaKey) -> &T {
        match self.get(key) {
            Some(value) => value,
            None => panic!("stale arena key {key:?}"),
        }
    }
}

impl<T> IndexMut<ArenaKey> for Arena<T> {
    fn index_mut(&mut self, key: ArenaKey) -> &mut T {
        match self.get_mut(key) {
            Some(value) => value,
            None => panic!("stale arena key {key:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removed_keys_do_not_alias_reused_slots() {
        let mut arena = Arena::new();
        let first = arena.insert("a").expect("分配槽位");
        assert_eq!(arena.remove(first), Some("a"));
        let second = arena.insert("b").expect("复用槽位");
        assert_eq!(first.slot(), second.slot());
        assert_ne!(first.generation(), second.generation());
        assert!(arena.get(first).is_none(), "旧键不得命中新值");
        assert_eq!(arena[second], "b");
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn drain_returns_only_occupied_values() {
        let mut arena = Arena::new();
        let a = arena.insert(1).expect("分配槽位");
        let _b = arena.insert(2).expect("分配槽位");
        arena.remove(a);
        let mut values = arena.drain();
        values.sort_unstable();
        assert_eq!(values, vec![2]);
        assert_eq!(arena.len(), 0);
        assert!(!arena.contains(a));
    }
}
