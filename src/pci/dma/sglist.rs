//! Userspace scatter/gather list of a DMA buffer.
//!
//! Nodes live in one vector and link to each other by slot index. A list is built
//! from the adapter's `sg` records in file order and then coalesced: adjacent
//! chunks (`a.device_address + a.length == b.device_address`) are merged until a
//! pass finds nothing left to merge.

use crate::uio::protocol::ScatterRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgNode {
    pub length: u64,
    /// Start of the chunk inside the buffer's virtual mapping.
    pub user_ptr: usize,
    pub device_address: u64,
    /// Opaque `page_link` of the first page, as exposed by the adapter.
    pub kernel_handle: u64,
    pub prev: Option<usize>,
    pub next: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SgList {
    nodes: Vec<SgNode>,
}

impl SgList {
    /// One node per record, user pointers running on from `base`.
    #[must_use]
    pub fn build(records: &[ScatterRecord], base: usize) -> Self {
        let mut user_ptr = base;
        let nodes = records
            .iter()
            .map(|record| {
                let node = SgNode {
                    length: u64::from(record.length),
                    user_ptr,
                    device_address: record.dma_address,
                    kernel_handle: record.page_link,
                    prev: None,
                    next: None,
                };
                user_ptr = user_ptr.wrapping_add(record.length as usize);
                node
            })
            .collect();

        let mut list = Self { nodes };
        list.relink();
        list
    }

    fn relink(&mut self) {
        let count = self.nodes.len();
        for (i, node) in self.nodes.iter_mut().enumerate() {
            node.prev = i.checked_sub(1);
            node.next = (i + 1 < count).then_some(i + 1);
        }
    }

    /// One scan over the links. A node absorbs its successor when both are
    /// contiguous on the bus; the absorbed node is left with length 0 and is skipped.
    fn merge_pass(&mut self) -> usize {
        let mut merges = 0;
        let mut cursor = self.head();

        while let Some(i) = cursor {
            cursor = self.nodes[i].next;

            let Some(next) = self.nodes[i].next else {
                continue;
            };
            if self.nodes[i].length == 0 {
                continue;
            }

            let end = self.nodes[i]
                .device_address
                .wrapping_add(self.nodes[i].length);
            if end == self.nodes[next].device_address {
                self.nodes[i].length += self.nodes[next].length;
                self.nodes[next].length = 0;
                merges += 1;
            }
        }

        merges
    }

    /// Merges adjacent chunks until a fixpoint is reached and returns the number of
    /// passes that merged something.
    pub fn coalesce(&mut self) -> usize {
        let mut passes = 0;

        while self.merge_pass() > 0 {
            self.nodes.retain(|node| node.length != 0);
            self.relink();
            passes += 1;
        }

        if passes > 0 {
            log::trace!(
                "sg list coalesced to {} entries in {passes} passes",
                self.nodes.len()
            );
        }
        passes
    }

    /// Moves every user pointer by the distance between the old and the new mapping
    /// base, after the buffer was remapped.
    pub(crate) fn rebase(&mut self, old_base: usize, new_base: usize) {
        for node in &mut self.nodes {
            node.user_ptr = node.user_ptr.wrapping_sub(old_base).wrapping_add(new_base);
        }
    }

    #[must_use]
    pub fn head(&self) -> Option<usize> {
        (!self.nodes.is_empty()).then_some(0)
    }

    #[must_use]
    pub fn get(&self, handle: usize) -> Option<&SgNode> {
        self.nodes.get(handle)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Walks the list from head to tail.
    pub fn iter(&self) -> impl Iterator<Item = &SgNode> {
        std::iter::successors(self.head().map(|i| &self.nodes[i]), |node| {
            node.next.map(|i| &self.nodes[i])
        })
    }

    #[must_use]
    pub fn total_length(&self) -> u64 {
        self.iter().map(|node| node.length).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uio::allocator::{PageRun, kernel_scatter, plan_chunks};

    const PAGE: u32 = 4096;

    fn record(dma_address: u64, length: u32) -> ScatterRecord {
        ScatterRecord {
            page_link: dma_address >> 12,
            offset: 0,
            length,
            dma_address,
        }
    }

    fn chunks(list: &SgList) -> Vec<(u64, u64)> {
        list.iter().map(|n| (n.device_address, n.length)).collect()
    }

    #[test]
    fn build_links_nodes_in_file_order() {
        let list = SgList::build(&[record(0x9000, PAGE), record(0x1000, 2 * PAGE)], 0x7000_0000);

        let nodes: Vec<&SgNode> = list.iter().collect();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].user_ptr, 0x7000_0000);
        assert_eq!(nodes[1].user_ptr, 0x7000_0000 + PAGE as usize);
        assert_eq!(nodes[0].prev, None);
        assert_eq!(nodes[0].next, Some(1));
        assert_eq!(nodes[1].prev, Some(0));
        assert_eq!(nodes[1].next, None);
        assert_eq!(nodes[0].kernel_handle, 9);
    }

    #[test]
    fn merges_contiguous_chunks_only() {
        let mut list = SgList::build(
            &[record(0x1000, PAGE), record(0x2000, PAGE), record(0x9000, PAGE)],
            0,
        );
        list.coalesce();
        assert_eq!(chunks(&list), vec![(0x1000, 8192), (0x9000, 4096)]);

        let second: Vec<usize> = list.iter().map(|n| n.user_ptr).collect();
        assert_eq!(second, vec![0, 8192]);
    }

    #[test]
    fn long_runs_need_several_passes() {
        let records: Vec<ScatterRecord> = (0..5)
            .map(|i| record(0x10_0000 + i * 0x1000, PAGE))
            .collect();
        let mut list = SgList::build(&records, 0);

        assert!(list.coalesce() >= 2);
        assert_eq!(chunks(&list), vec![(0x10_0000, 5 * 4096)]);
        assert_eq!(list.get(0).unwrap().next, None);
    }

    #[test]
    fn coalescing_is_idempotent() {
        let mut list = SgList::build(
            &[
                record(0x1000, PAGE),
                record(0x2000, PAGE),
                record(0x4000, 2 * PAGE),
                record(0x6000, PAGE),
                record(0x20000, PAGE),
            ],
            0,
        );
        list.coalesce();
        let once = list.clone();
        assert_eq!(list.coalesce(), 0);
        assert_eq!(list, once);
        assert_eq!(chunks(&list), vec![(0x1000, 8192), (0x4000, 12288), (0x20000, 4096)]);
    }

    #[test]
    fn coverage_holds_for_every_size() {
        let page = u64::from(PAGE);
        for pages in 1..=96u64 {
            let mut next = 0x100_0000u64;
            let runs: Vec<PageRun> = plan_chunks(pages, 3)
                .into_iter()
                .enumerate()
                .map(|(i, order)| {
                    let length = (1u64 << order) * page;
                    // every third run leaves a hole
                    if i % 3 == 2 {
                        next += page;
                    }
                    let run = PageRun {
                        page_link: next / page,
                        dma_address: next,
                        length,
                    };
                    next += length;
                    run
                })
                .rev()
                .collect();

            let mut list = SgList::build(&kernel_scatter(&runs), 0);
            list.coalesce();
            assert_eq!(list.total_length(), pages * page, "pages = {pages}");
            assert!(list.iter().all(|n| n.length > 0));

            let ptrs: Vec<usize> = list.iter().map(|n| n.user_ptr).collect();
            assert!(ptrs.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn unsorted_user_chunks_merge_only_when_in_order() {
        let mut list = SgList::build(
            &[record(0x3000, PAGE), record(0x2000, PAGE), record(0x4000, PAGE)],
            0,
        );
        assert_eq!(list.coalesce(), 0);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn rebase_moves_user_pointers() {
        let mut list = SgList::build(&[record(0x1000, PAGE), record(0x9000, PAGE)], 0x1000_0000);
        list.rebase(0x1000_0000, 0x2000_0000);
        let ptrs: Vec<usize> = list.iter().map(|n| n.user_ptr).collect();
        assert_eq!(ptrs, vec![0x2000_0000, 0x2000_1000]);
        assert!(SgList::build(&[], 0).is_empty());
    }
}
