/// Advisory aggregate counts over all published segments.
///
/// Collected without a global pause, so concurrent creations and deletions
/// may be observed inconsistently; treat every field as an approximation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ElementsStat {
    pub node_count: u64,
    pub link_count: u64,
    pub arc_count: u64,
    pub empty_count: u64,
    pub segments_count: u32,
}

impl ElementsStat {
    /// Total live (non-empty) elements observed.
    pub fn live_count(&self) -> u64 {
        self.node_count + self.link_count + self.arc_count
    }
}
