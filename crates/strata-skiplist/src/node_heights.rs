use oorandom::Rand32;


/// The maximum height of any skiplist node.
///
/// With [`random_node_height`], one node is generated with this maximum height per approximately
/// 4 million inserted entries (on average).
pub(crate) const MAX_HEIGHT: usize = 12;

/// The chance of a node's height being increased by one more level is `1/BRANCHING`.
const BRANCHING: u32 = 4;


/// Return a random value in `1..=MAX_HEIGHT`, in a geometric distribution (higher values are
/// exponentially less likely).
///
/// Technically, `MAX_HEIGHT` is slightly more likely than it would be in an exact and unbounded
/// geometric distribution, since what would be higher values are capped to `MAX_HEIGHT`.
pub(crate) fn random_node_height(prng: &mut Rand32) -> usize {
    let mut height = 1;
    while height < MAX_HEIGHT && prng.rand_u32() % BRANCHING == 0 {
        height += 1;
    }
    height
}


#[cfg(test)]
mod tests {
    use super::*;


    #[test]
    fn heights_stay_in_bounds() {
        let mut prng = Rand32::new(0xdead_beef);
        for _ in 0..10_000 {
            let height = random_node_height(&mut prng);
            assert!(1 <= height && height <= MAX_HEIGHT);
        }
    }

    #[test]
    fn heights_are_roughly_geometric() {
        let mut prng = Rand32::new(42);
        let mut ones = 0_u32;
        for _ in 0..10_000 {
            if random_node_height(&mut prng) == 1 {
                ones += 1;
            }
        }
        // Expected proportion of height-1 nodes is 3/4.
        assert!(ones > 6_500 && ones < 8_500);
    }
}
