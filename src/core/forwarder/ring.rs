// src/core/forwarder/ring.rs

//! Consistent-hash placement of keys onto backend nodes.

use crate::config::{HashDistribution, HashMethod};
use crc::{CRC_16_XMODEM, Crc};
use std::io::Cursor;

/// Virtual points per node on the ketama ring.
const POINTS_PER_NODE: usize = 160;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

fn fnv1a64(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in data {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

fn hash_with(method: HashMethod, data: &[u8]) -> u64 {
    match method {
        HashMethod::Fnv1a64 => fnv1a64(data),
        HashMethod::Crc16 => u64::from(CRC16.checksum(data)),
        HashMethod::Murmur3 => {
            u64::from(murmur3::murmur3_32(&mut Cursor::new(data), 0).unwrap_or_default())
        }
    }
}

/// Key placement over a fixed node set. Rebuilt wholesale on config change;
/// immutable afterwards, so lookups need no synchronization.
pub struct HashRing {
    method: HashMethod,
    distribution: HashDistribution,
    /// (hash point, node index), sorted by point. Empty for modula.
    points: Vec<(u64, usize)>,
    node_count: usize,
}

impl HashRing {
    pub fn build(servers: &[String], method: HashMethod, distribution: HashDistribution) -> Self {
        let mut points = Vec::new();
        if distribution == HashDistribution::Ketama {
            points.reserve(servers.len() * POINTS_PER_NODE);
            for (index, server) in servers.iter().enumerate() {
                for point in 0..POINTS_PER_NODE {
                    let label = format!("{server}-{point}");
                    points.push((hash_with(method, label.as_bytes()), index));
                }
            }
            points.sort_unstable();
        }
        Self {
            method,
            distribution,
            points,
            node_count: servers.len(),
        }
    }

    pub fn hash_key(&self, key: &[u8]) -> u64 {
        hash_with(self.method, key)
    }

    /// The preferred node for a hash value.
    pub fn node_for(&self, hash: u64) -> usize {
        self.candidates(hash).first().copied().unwrap_or_default()
    }

    /// Every node index in fallback order for a hash value: the preferred
    /// node first, then the remaining nodes walking the ring (or the modulus
    /// sequence), each yielded once.
    pub fn candidates(&self, hash: u64) -> Vec<usize> {
        if self.node_count == 0 {
            return Vec::new();
        }
        match self.distribution {
            HashDistribution::Modula => {
                let start = (hash % self.node_count as u64) as usize;
                (0..self.node_count)
                    .map(|step| (start + step) % self.node_count)
                    .collect()
            }
            HashDistribution::Ketama => {
                let mut cursor = self.points.partition_point(|(point, _)| *point < hash);
                let mut seen = vec![false; self.node_count];
                let mut order = Vec::with_capacity(self.node_count);
                for _ in 0..self.points.len() {
                    if cursor >= self.points.len() {
                        cursor = 0;
                    }
                    let (_, node) = self.points[cursor];
                    cursor += 1;
                    if !seen[node] {
                        seen[node] = true;
                        order.push(node);
                        if order.len() == self.node_count {
                            break;
                        }
                    }
                }
                order
            }
        }
    }
}

/// Narrows a key to its hash-tag portion, e.g. `user:{42}:profile` with tag
/// `"{}"` hashes only `42`. Keys without a complete tag hash whole.
pub fn extract_hash_tag<'a>(key: &'a [u8], tag: &str) -> &'a [u8] {
    let tag = tag.as_bytes();
    if tag.len() != 2 {
        return key;
    }
    let Some(open) = key.iter().position(|b| *b == tag[0]) else {
        return key;
    };
    let Some(close) = key[open + 1..].iter().position(|b| *b == tag[1]) else {
        return key;
    };
    if close == 0 {
        return key;
    }
    &key[open + 1..open + 1 + close]
}
