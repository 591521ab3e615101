//! MurmurHash3 (x86, 32-bit) as required by BIP37 bloom filters

const C1: u32 = 0xcc9e2d51;
const C2: u32 = 0x1b873593;

#[inline]
fn mix(k: u32) -> u32 {
    k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2)
}

/// Compute the 32-bit MurmurHash3 of `data` with `seed`
pub fn murmur3(data: &[u8], seed: u32) -> u32 {
    let mut hash = seed;

    let mut blocks = data.chunks_exact(4);
    for block in &mut blocks {
        let k = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
        hash ^= mix(k);
        hash = hash.rotate_left(13).wrapping_mul(5).wrapping_add(0xe6546b64);
    }

    let tail = blocks.remainder();
    if !tail.is_empty() {
        let mut k = 0u32;
        for (i, byte) in tail.iter().enumerate() {
            k ^= (*byte as u32) << (8 * i);
        }
        hash ^= mix(k);
    }

    // Finalization
    hash ^= data.len() as u32;
    hash ^= hash >> 16;
    hash = hash.wrapping_mul(0x85ebca6b);
    hash ^= hash >> 13;
    hash = hash.wrapping_mul(0xc2b2ae35);
    hash ^= hash >> 16;

    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_murmur3_reference_vectors() {
        assert_eq!(murmur3(b"", 0), 0);
        assert_eq!(murmur3(b"", 0xffffffff), 0x81f16f39);
        assert_eq!(murmur3(&[0x21, 0x43, 0x65, 0x87], 0), 0xf55b516b);
        assert_eq!(murmur3(&[0x21, 0x43, 0x65, 0x87], 0x5082edee), 0x2362f9de);
        assert_eq!(murmur3(&[0x21, 0x43, 0x65], 0), 0x7e4a8634);
        assert_eq!(murmur3(&[0x21, 0x43], 0), 0xa0f7b07a);
        assert_eq!(murmur3(&[0x21], 0), 0x72661cf4);
        assert_eq!(murmur3(&[0, 0, 0, 0], 0), 0x2362f9de);
    }

    #[test]
    fn test_murmur3_bip37_seed() {
        assert_eq!(murmur3(b"", 0xfba4c795), 0x6a396f08);
        assert_eq!(murmur3(&[0x00], 0xfba4c795), 0xea3f0b17);
    }
}
