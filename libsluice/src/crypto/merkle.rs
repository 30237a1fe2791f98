use alloy_primitives::{keccak256, B256};

/// Root of the binary keccak merkle tree over the given leaves, after sorting and deduplicating
/// them. The active-transfer set is committed this way: each leaf is a transfer's initial-state
/// hash, so membership can be proven to the on-chain dispute logic.
///
/// An empty set commits to the zero hash. Odd nodes are carried up unhashed.
pub fn merkle_root<I>(leaves: I) -> B256
where
    I: IntoIterator<Item = B256>,
{
    let mut layer: Vec<B256> = leaves.into_iter().collect();
    layer.sort();
    layer.dedup();
    if layer.is_empty() {
        return B256::ZERO;
    }
    while layer.len() > 1 {
        let mut next = Vec::with_capacity(layer.len().div_ceil(2));
        for pair in layer.chunks(2) {
            match pair {
                [left, right] => next.push(hash_pair(*left, *right)),
                [odd] => next.push(*odd),
                _ => unreachable!("chunks(2) yields one or two elements"),
            }
        }
        layer = next;
    }
    layer[0]
}

fn hash_pair(left: B256, right: B256) -> B256 {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left.as_slice());
    buf[32..].copy_from_slice(right.as_slice());
    keccak256(buf)
}

#[cfg(test)]
mod test {
    use super::*;
    use alloy_primitives::b256;

    const A: B256 = b256!("0101010101010101010101010101010101010101010101010101010101010101");
    const B: B256 = b256!("0202020202020202020202020202020202020202020202020202020202020202");
    const C: B256 = b256!("0303030303030303030303030303030303030303030303030303030303030303");

    #[test]
    fn empty_set_is_zero() {
        assert_eq!(merkle_root([]), B256::ZERO);
    }

    #[test]
    fn single_leaf_is_itself() {
        assert_eq!(merkle_root([A]), A);
    }

    #[test]
    fn pair_hashes_in_sorted_order() {
        let root = merkle_root([B, A]);
        assert_eq!(root, merkle_root([A, B]));
        assert_eq!(root, hash_pair(A, B));
    }

    #[test]
    fn odd_leaf_carries_up() {
        let root = merkle_root([A, B, C]);
        assert_eq!(root, hash_pair(hash_pair(A, B), C));
    }

    #[test]
    fn duplicates_collapse() {
        assert_eq!(merkle_root([A, A]), A);
        assert_eq!(merkle_root([A, B, B]), merkle_root([A, B]));
    }
}
