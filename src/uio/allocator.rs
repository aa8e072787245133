//! Allocation policy of the kernel adapter, as seen through its `sg` file.
//!
//! Kernel-backed buffers are built from the largest physically contiguous page runs
//! the buddy allocator will hand out, then sorted by bus address after IOMMU
//! programming. Pinned user buffers keep one entry per page in virtual order and are
//! never sorted, since the caller's layout must be preserved.

use super::protocol::ScatterRecord;

/// A physically contiguous run handed out by the page allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRun {
    /// Opaque kernel handle of the first page (`page_link`).
    pub page_link: u64,
    /// Bus address after IOMMU programming.
    pub dma_address: u64,
    pub length: u64,
}

#[must_use]
pub const fn pages_for(size: u64, page_size: u64) -> u64 {
    size.div_ceil(page_size)
}

/// Largest order whose run length still fits the 32-bit `length` of a scatter record.
#[must_use]
pub const fn record_order_limit(page_size: u64) -> u32 {
    (u32::MAX as u64 / page_size).ilog2()
}

/// Buddy orders of the runs used to satisfy `pages` pages.
///
/// Starts at the order covering the whole request (capped at `max_order`) and steps
/// down whenever a run would exceed what is left, so the result is non-increasing
/// and sums to exactly `pages` pages.
#[must_use]
pub fn plan_chunks(pages: u64, max_order: u32) -> Vec<u32> {
    let mut orders = Vec::new();
    if pages == 0 {
        return orders;
    }

    let mut order = pages.next_power_of_two().trailing_zeros().min(max_order);
    let mut pages_left = pages;

    while pages_left > 0 {
        while (1u64 << order) > pages_left {
            order -= 1;
        }
        orders.push(order);
        pages_left -= 1u64 << order;
    }

    orders
}

/// Converts runs into `sg` records in the order given. Runs must come from a plan
/// capped at [`record_order_limit`]; longer ones are dropped with an error log.
#[must_use]
pub fn to_scatter(runs: &[PageRun]) -> Vec<ScatterRecord> {
    runs.iter()
        .filter_map(|run| match u32::try_from(run.length) {
            Ok(length) => Some(ScatterRecord {
                page_link: run.page_link,
                offset: 0,
                length,
                dma_address: run.dma_address,
            }),
            Err(_) => {
                log::error!("run of {:#x} bytes does not fit a scatter record", run.length);
                None
            }
        })
        .collect()
}

/// IOMMU programming may reorder entries, so kernel buffers are exposed sorted by
/// ascending bus address. This is what makes adjacency in userspace meaningful.
pub fn sort_by_device_address(records: &mut [ScatterRecord]) {
    records.sort_by_key(|r| r.dma_address);
}

/// Scatter list of a kernel-backed buffer: runs after IOMMU programming, sorted.
#[must_use]
pub fn kernel_scatter(runs: &[PageRun]) -> Vec<ScatterRecord> {
    let mut records = to_scatter(runs);
    sort_by_device_address(&mut records);
    records
}

/// Scatter list of a pinned user buffer: one page per entry, in virtual order.
#[must_use]
pub fn user_scatter(page_addresses: &[u64], page_size: u64) -> Vec<ScatterRecord> {
    let runs: Vec<PageRun> = page_addresses
        .iter()
        .map(|&addr| PageRun {
            page_link: addr,
            dma_address: addr,
            length: page_size,
        })
        .collect();
    to_scatter(&runs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_plan_covers_request() {
        for pages in 1..=300u64 {
            let plan = plan_chunks(pages, 4);
            let total: u64 = plan.iter().map(|&o| 1u64 << o).sum();
            assert_eq!(total, pages, "pages = {pages}");
            assert!(plan.windows(2).all(|w| w[0] >= w[1]));
            assert!(plan.iter().all(|&o| o <= 4));
        }
    }

    #[test]
    fn chunk_plan_prefers_large_runs() {
        assert_eq!(plan_chunks(8, 10), vec![3]);
        assert_eq!(plan_chunks(7, 10), vec![2, 1, 0]);
        assert_eq!(plan_chunks(40, 4), vec![4, 4, 3]);
        assert!(plan_chunks(0, 4).is_empty());
    }

    #[test]
    fn kernel_scatter_is_sorted_user_scatter_is_not() {
        let runs = [
            PageRun {
                page_link: 1,
                dma_address: 0x9000,
                length: 4096,
            },
            PageRun {
                page_link: 2,
                dma_address: 0x1000,
                length: 8192,
            },
        ];
        let sorted = kernel_scatter(&runs);
        assert_eq!(sorted[0].dma_address, 0x1000);
        assert_eq!(sorted[0].length, 8192);
        assert_eq!(sorted[1].dma_address, 0x9000);

        let user = user_scatter(&[0x5000, 0x2000, 0x3000], 4096);
        let addrs: Vec<u64> = user.iter().map(|r| r.dma_address).collect();
        assert_eq!(addrs, vec![0x5000, 0x2000, 0x3000]);
        assert!(user.iter().all(|r| r.length == 4096));
    }

    #[test]
    fn capped_runs_fit_scatter_records() {
        let page = 4096u64;
        let limit = record_order_limit(page);
        assert_eq!(limit, 19);
        assert!(page << limit <= u64::from(u32::MAX));
        assert!(page << (limit + 1) > u64::from(u32::MAX));

        let pages = (1u64 << 21) + 3;
        let orders = plan_chunks(pages, 30.min(limit));
        assert!(orders.iter().all(|&o| o <= limit));

        let mut next = 0u64;
        let runs: Vec<PageRun> = orders
            .iter()
            .map(|&order| {
                let length = (1u64 << order) * page;
                let run = PageRun {
                    page_link: next / page,
                    dma_address: next,
                    length,
                };
                next += length;
                run
            })
            .collect();
        let total: u64 = to_scatter(&runs).iter().map(|r| u64::from(r.length)).sum();
        assert_eq!(total, pages * page);
    }

    #[test]
    fn page_count_rounds_up() {
        assert_eq!(pages_for(1, 4096), 1);
        assert_eq!(pages_for(4096, 4096), 1);
        assert_eq!(pages_for(4097, 4096), 2);
    }
}
