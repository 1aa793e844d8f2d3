/// Split the inclusive block range `[from, to]` into consecutive inclusive
/// chunks of at most `chunk_size` blocks, for providers that cap the block
/// span of a single `eth_getLogs` request.
pub fn chunk_ranges(from: u64, to: u64, chunk_size: u64) -> Vec<(u64, u64)> {
    if from > to {
        return Vec::new();
    }
    let chunk_size = chunk_size.max(1);

    let mut ranges = Vec::new();
    let mut start = from;
    loop {
        let end = start.saturating_add(chunk_size - 1).min(to);
        ranges.push((start, end));
        if end == to {
            break;
        }
        start = end + 1;
    }
    ranges
}
