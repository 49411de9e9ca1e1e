use std::collections::BinaryHeap;

use super::Neighbor;

/// 保留得分最高的 k 个邻居
///
/// `Neighbor` 的排序中“更差”的邻居更大，所以堆顶总是当前最差的那个。
/// 会按 k 预先分配空间，调用方需要先把 k 限制在候选数量以内
pub struct TopKNeighbors {
    heap: BinaryHeap<Neighbor>,
    k: usize,
}

impl TopKNeighbors {
    pub fn new(k: usize) -> Self {
        Self { heap: BinaryHeap::with_capacity(k.saturating_add(1)), k }
    }

    #[inline]
    pub fn push(&mut self, neighbor: Neighbor) {
        if self.heap.len() < self.k {
            self.heap.push(neighbor);
        } else if let Some(mut worst) = self.heap.peek_mut() {
            if neighbor < *worst {
                *worst = neighbor;
            }
        }
    }

    pub fn extend(&mut self, neighbors: impl IntoIterator<Item = Neighbor>) {
        for neighbor in neighbors {
            self.push(neighbor);
        }
    }

    /// 按得分从高到低返回
    pub fn into_sorted_vec(self) -> Vec<Neighbor> {
        self.heap.into_sorted_vec()
    }
}
