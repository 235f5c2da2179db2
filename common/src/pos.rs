use vek::*;

/// Packs a column position into a single key: X in the high 32 bits, Z in
/// the low 32 bits. `Vec2::y` holds the column Z coordinate throughout.
#[inline]
pub fn pack_column(key: Vec2<i32>) -> i64 { ((key.x as i64) << 32) | (key.y as u32 as i64) }

#[inline]
pub fn unpack_column(packed: i64) -> Vec2<i32> { Vec2::new((packed >> 32) as i32, packed as i32) }

/// Chebyshev distance between two columns, computed in 64 bits so extreme
/// coordinates never overflow.
#[inline]
pub fn column_distance(a: Vec2<i32>, b: Vec2<i32>) -> i64 {
    let dx = (a.x as i64 - b.x as i64).abs();
    let dz = (a.y as i64 - b.y as i64).abs();
    dx.max(dz)
}

/// Whether `key` lies inside the square of radius `radius` around `center`.
#[inline]
pub fn within_distance(center: Vec2<i32>, key: Vec2<i32>, radius: u32) -> bool {
    column_distance(center, key) <= radius as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_roundtrip_extremes() {
        let values = [i32::MIN, i32::MIN + 1, -1, 0, 1, 12345, -98765, i32::MAX - 1, i32::MAX];
        for &x in &values {
            for &z in &values {
                let key = Vec2::new(x, z);
                assert_eq!(unpack_column(pack_column(key)), key);
            }
        }
    }

    #[test]
    fn pack_is_injective_for_neighbours() {
        let a = pack_column(Vec2::new(0, -1));
        let b = pack_column(Vec2::new(-1, 0));
        let c = pack_column(Vec2::new(0, 0));
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
    }

    #[test]
    fn packed_layout() {
        assert_eq!(pack_column(Vec2::new(1, 2)), (1i64 << 32) | 2);
        assert_eq!(pack_column(Vec2::new(0, -1)), 0xFFFF_FFFF);
    }

    #[test]
    fn chebyshev_distance() {
        assert_eq!(column_distance(Vec2::new(0, 0), Vec2::new(3, -7)), 7);
        assert_eq!(
            column_distance(Vec2::new(i32::MIN, 0), Vec2::new(i32::MAX, 0)),
            u32::MAX as i64
        );
        assert!(within_distance(Vec2::new(10, 10), Vec2::new(14, 6), 4));
        assert!(!within_distance(Vec2::new(10, 10), Vec2::new(15, 6), 4));
    }
}
