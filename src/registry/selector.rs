//! 节点选择模块
//!
//! 客户端解析到多个节点后，通过选择策略挑出一个发起调用

use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::types::Node;

/// 选择策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectStrategy {
    /// 轮询（Round Robin）
    #[default]
    RoundRobin,
    /// 随机（Random）
    Random,
}

/// 节点选择器
#[derive(Debug, Default)]
pub struct Selector {
    strategy: SelectStrategy,
    round_robin_index: AtomicUsize,
}

impl Selector {
    pub fn new(strategy: SelectStrategy) -> Self {
        Self {
            strategy,
            round_robin_index: AtomicUsize::new(0),
        }
    }

    pub fn strategy(&self) -> SelectStrategy {
        self.strategy
    }

    /// 选择节点
    pub fn select<'a>(&self, nodes: &'a [Node]) -> Option<&'a Node> {
        if nodes.is_empty() {
            return None;
        }

        match self.strategy {
            SelectStrategy::RoundRobin => {
                let index = self.round_robin_index.fetch_add(1, Ordering::Relaxed);
                nodes.get(index % nodes.len())
            }
            SelectStrategy::Random => {
                let index = rand::thread_rng().gen_range(0..nodes.len());
                nodes.get(index)
            }
        }
    }
}
