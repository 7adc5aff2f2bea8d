use crate::{hashes, Distribution};
use rand::Rng;

/// Ketama places `160 / 4` hash rounds per unit-weight server, four points
/// per MD5 round.
const KETAMA_POINTS_PER_SERVER: u32 = 160;
const KETAMA_POINTS_PER_HASH: u32 = 4;

/// A live pool member feeding the continuum build. `index` is the server's
/// position in the pool's full server array, preserved across ejections so
/// dispatch results stay meaningful to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seed {
    pub index: u32,
    pub name: String,
    pub weight: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Point {
    value: u32,
    index: u32,
}

/// A precomputed mapping from hash values to server indices. Rebuilt from
/// scratch whenever the live set changes; dispatch never mutates.
#[derive(Debug, Clone)]
pub struct Continuum {
    dist: Distribution,
    points: Vec<Point>,
}

impl Continuum {
    pub fn build(dist: Distribution, seeds: &[Seed]) -> Continuum {
        let points = match dist {
            Distribution::Ketama => build_ketama(seeds),
            Distribution::Modula => build_modula(seeds),
            Distribution::Random => build_random(seeds),
        };
        Continuum { dist, points }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Map a key hash to a server index. `None` only when the live set was
    /// empty at build time.
    pub fn dispatch(&self, hash: u32) -> Option<u32> {
        if self.points.is_empty() {
            return None;
        }
        let idx = match self.dist {
            Distribution::Ketama => {
                // Least point with value >= hash, wrapping past the top.
                let i = self.points.partition_point(|p| p.value < hash);
                if i == self.points.len() {
                    0
                } else {
                    i
                }
            }
            Distribution::Modula => (hash as usize) % self.points.len(),
            Distribution::Random => rand::thread_rng().gen_range(0..self.points.len()),
        };
        Some(self.points[idx].index)
    }

    #[cfg(test)]
    fn values(&self) -> impl Iterator<Item = u32> + '_ {
        self.points.iter().map(|p| p.value)
    }
}

fn ketama_point(host: &[u8], alignment: usize) -> u32 {
    let d = ::md5::compute(host);
    u32::from_le_bytes([
        d[alignment * 4],
        d[1 + alignment * 4],
        d[2 + alignment * 4],
        d[3 + alignment * 4],
    ])
}

fn build_ketama(seeds: &[Seed]) -> Vec<Point> {
    let nlive = seeds.len() as u32;
    let total_weight: u32 = seeds.iter().map(|s| s.weight).sum();
    if nlive == 0 || total_weight == 0 {
        return Vec::new();
    }

    let mut points = Vec::with_capacity((nlive * KETAMA_POINTS_PER_SERVER) as usize);
    for seed in seeds {
        let pct = seed.weight as f32 / total_weight as f32;
        // Keep the original's f32 rounding so point placement is identical.
        let per_server = ((pct * (KETAMA_POINTS_PER_SERVER / KETAMA_POINTS_PER_HASH) as f32
            * nlive as f32)
            + 0.0000000001)
            .floor() as u32
            * KETAMA_POINTS_PER_HASH;

        for round in 0..per_server / KETAMA_POINTS_PER_HASH {
            let host = format!("{}-{}", seed.name, round);
            for alignment in 0..KETAMA_POINTS_PER_HASH as usize {
                points.push(Point {
                    value: ketama_point(host.as_bytes(), alignment),
                    index: seed.index,
                });
            }
        }
    }

    points.sort_by_key(|p| p.value);
    points
}

fn build_modula(seeds: &[Seed]) -> Vec<Point> {
    let mut points = Vec::new();
    for seed in seeds {
        for _ in 0..seed.weight {
            points.push(Point {
                value: 0,
                index: seed.index,
            });
        }
    }
    points
}

fn build_random(seeds: &[Seed]) -> Vec<Point> {
    seeds
        .iter()
        .map(|s| Point {
            value: 0,
            index: s.index,
        })
        .collect()
}

/// Hash the routing key with the named function.
pub fn hash_key(hash: crate::Hash, key: &[u8]) -> u32 {
    use crate::Hash::*;
    match hash {
        OneAtATime => hashes::one_at_a_time(key),
        Md5 => hashes::md5(key),
        Crc16 => hashes::crc16(key),
        Crc32 => hashes::crc32(key),
        Crc32a => hashes::crc32a(key),
        Fnv1_64 => hashes::fnv1_64(key),
        Fnv1a_64 => hashes::fnv1a_64(key),
        Fnv1_32 => hashes::fnv1_32(key),
        Fnv1a_32 => hashes::fnv1a_32(key),
        Hsieh => hashes::hsieh(key),
        Murmur => hashes::murmur(key),
        Jenkins => hashes::jenkins(key),
    }
}
