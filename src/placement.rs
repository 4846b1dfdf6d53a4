use std::fmt;

/// Strategy used to pick, among the blocks with enough spare capacity, the one
/// that will serve a request.
///
/// Every strategy scans the ledger in order, so ties are always broken in favor
/// of the block found first (the oldest region, the lowest address inside it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Placement {
    /// The first block that fits. Cheapest scan, tends to pack the oldest regions.
    #[default]
    FirstFit,
    /// The block that leaves the least spare capacity behind. An exact fit ends
    /// the scan right away.
    BestFit,
    /// The block that leaves the most spare capacity behind.
    WorstFit,
}

impl Placement {
    /// Parses the name used by the `ALLOCATOR_ALGORITHM` setting. Anything
    /// unknown selects [`Placement::FirstFit`].
    pub fn from_name(name: &str) -> Self {
        match name {
            "best_fit" => Self::BestFit,
            "worst_fit" => Self::WorstFit,
            _ => Self::FirstFit,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::FirstFit => "first_fit",
            Self::BestFit => "best_fit",
            Self::WorstFit => "worst_fit",
        }
    }

    /// Returns the candidate that should hold `required` bytes, or `None` if no
    /// candidate has that much spare capacity.
    ///
    /// `candidates` yields each block together with its spare capacity, in
    /// ledger order.
    pub fn select<T>(
        self,
        candidates: impl IntoIterator<Item = (T, usize)>,
        required: usize,
    ) -> Option<T> {
        let mut fits = candidates
            .into_iter()
            .filter(|(_, spare)| *spare >= required);

        match self {
            Self::FirstFit => fits.next().map(|(candidate, _)| candidate),

            Self::BestFit => {
                let mut best: Option<(T, usize)> = None;

                for (candidate, spare) in fits {
                    if spare == required {
                        return Some(candidate);
                    }
                    if best.as_ref().is_none_or(|(_, min)| spare < *min) {
                        best = Some((candidate, spare));
                    }
                }

                best.map(|(candidate, _)| candidate)
            }

            Self::WorstFit => {
                let mut worst: Option<(T, usize)> = None;

                for (candidate, spare) in fits {
                    if worst.as_ref().is_none_or(|(_, max)| spare > *max) {
                        worst = Some((candidate, spare));
                    }
                }

                worst.map(|(candidate, _)| candidate)
            }
        }
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCKS: [(&str, usize); 3] = [("a", 500), ("b", 50), ("c", 200)];

    #[test]
    fn each_policy_picks_its_block() {
        assert_eq!(Some("a"), Placement::FirstFit.select(BLOCKS, 40));
        assert_eq!(Some("b"), Placement::BestFit.select(BLOCKS, 40));
        assert_eq!(Some("a"), Placement::WorstFit.select(BLOCKS, 40));
    }

    #[test]
    fn blocks_without_enough_spare_are_skipped() {
        assert_eq!(Some("c"), Placement::FirstFit.select(BLOCKS[1..].iter().copied(), 60));
        assert_eq!(Some("a"), Placement::BestFit.select(BLOCKS, 201));
        assert_eq!(None, Placement::WorstFit.select(BLOCKS, 501));
    }

    #[test]
    fn nothing_to_select_from_an_empty_ledger() {
        for policy in [Placement::FirstFit, Placement::BestFit, Placement::WorstFit] {
            assert_eq!(None, policy.select(Vec::<(u8, usize)>::new(), 1));
        }
    }

    #[test]
    fn best_fit_stops_at_an_exact_match() {
        let blocks = [(0, 90), (1, 64), (2, 64), (3, 70)];
        assert_eq!(Some(1), Placement::BestFit.select(blocks, 64));
    }

    #[test]
    fn ties_keep_the_earliest_block() {
        let blocks = [(0, 80), (1, 300), (2, 80), (3, 300)];

        assert_eq!(Some(0), Placement::BestFit.select(blocks, 64));
        assert_eq!(Some(1), Placement::WorstFit.select(blocks, 64));
    }

    #[test]
    fn unknown_names_fall_back_to_first_fit() {
        assert_eq!(Placement::BestFit, Placement::from_name("best_fit"));
        assert_eq!(Placement::WorstFit, Placement::from_name("worst_fit"));
        assert_eq!(Placement::FirstFit, Placement::from_name("first_fit"));
        assert_eq!(Placement::FirstFit, Placement::from_name("BEST_FIT"));
        assert_eq!(Placement::FirstFit, Placement::from_name(""));

        for policy in [Placement::FirstFit, Placement::BestFit, Placement::WorstFit] {
            assert_eq!(policy, Placement::from_name(&policy.to_string()));
        }
    }
}
