//! Persistent skip list, the day index of the journal engine
//!
//! Nodes live in the data region and are only touched through the pager, so
//! every change is part of the surrounding transaction. Node layout:
//!
//! - 1 byte: level
//! - 1 byte: key length
//! - key bytes
//! - 8 bytes: value
//! - level x 8 bytes: forward handles (0 = end)
//!
//! The head node has `MAX_LEVEL` levels and an empty key. Keys compare as raw
//! bytes.

use super::pager::Pager;
use crate::{BlobError, Result};
use bytes::BufMut;
use rand::Rng;

pub const MAX_LEVEL: usize = 12;
const BRANCHING_FACTOR: u32 = 4;
const MAX_KEY: usize = u8::MAX as usize;

#[derive(Debug, Clone)]
struct Node {
    offset: u64,
    key: Vec<u8>,
    value: u64,
    forward: Vec<u64>,
}

impl Node {
    fn encoded_len(key_len: usize, level: usize) -> usize {
        2 + key_len + 8 + 8 * level
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::encoded_len(self.key.len(), self.forward.len()));
        buf.put_u8(self.forward.len() as u8);
        buf.put_u8(self.key.len() as u8);
        buf.put_slice(&self.key);
        buf.put_u64(self.value);
        for next in &self.forward {
            buf.put_u64(*next);
        }
        buf
    }

    fn forward_offset(&self, level: usize) -> u64 {
        self.offset + (2 + self.key.len() + 8 + 8 * level) as u64
    }

    fn value_offset(&self) -> u64 {
        self.offset + (2 + self.key.len()) as u64
    }

    fn read(pager: &Pager, offset: u64) -> Result<Self> {
        let head = pager.read(offset, 2)?;
        let (level, key_len) = (head[0] as usize, head[1] as usize);
        if level == 0 || level > MAX_LEVEL {
            return Err(BlobError::Corruption(format!(
                "skip list node at {} has level {}",
                offset, level
            )));
        }

        let raw = pager.read(offset + 2, key_len + 8 + 8 * level)?;
        let key = raw[..key_len].to_vec();
        let words: Vec<u64> = raw[key_len..]
            .chunks_exact(8)
            .map(|word| {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(word);
                u64::from_be_bytes(bytes)
            })
            .collect();

        Ok(Self {
            offset,
            key,
            value: words[0],
            forward: words[1..].to_vec(),
        })
    }
}

/// Handle to a skip list rooted at its head node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkipList {
    head: u64,
}

impl SkipList {
    /// Allocate an empty list inside the open transaction
    pub fn create(pager: &mut Pager) -> u64 {
        let head = Node {
            offset: 0,
            key: Vec::new(),
            value: 0,
            forward: vec![0; MAX_LEVEL],
        };
        let encoded = head.encode();
        let offset = pager.allocate(encoded.len() as u64);
        pager.write(offset, &encoded);
        offset
    }

    /// Open the list whose head node is at `head`
    pub fn open(pager: &Pager, head: u64) -> Result<Self> {
        let node = Node::read(pager, head)?;
        if node.forward.len() != MAX_LEVEL || !node.key.is_empty() {
            return Err(BlobError::Corruption(format!(
                "no skip list head at {}",
                head
            )));
        }
        Ok(Self { head })
    }

    /// Value stored under `key`
    pub fn get(&self, pager: &Pager, key: &[u8]) -> Result<Option<u64>> {
        let (_, candidate) = self.search(pager, key)?;
        Ok(candidate.filter(|node| node.key == key).map(|node| node.value))
    }

    /// Insert `key`, or overwrite its value if present
    pub fn insert(&self, pager: &mut Pager, key: &[u8], value: u64) -> Result<()> {
        if key.len() > MAX_KEY {
            return Err(BlobError::InvalidKey(format!(
                "skip list key of {} bytes",
                key.len()
            )));
        }

        let (update, candidate) = self.search(pager, key)?;
        if let Some(node) = candidate.filter(|node| node.key == key) {
            pager.write_u64(node.value_offset(), value);
            return Ok(());
        }

        let level = random_level();
        let mut node = Node {
            offset: 0,
            key: key.to_vec(),
            value,
            forward: update[..level].iter().map(|prev| prev.forward_next).collect(),
        };
        node.offset = pager.allocate(Node::encoded_len(key.len(), level) as u64);
        pager.write(node.offset, &node.encode());

        for prev in &update[..level] {
            pager.write_u64(prev.forward_at, node.offset);
        }
        Ok(())
    }

    /// Smallest entry
    pub fn first(&self, pager: &Pager) -> Result<Option<(Vec<u8>, u64)>> {
        let head = Node::read(pager, self.head)?;
        match head.forward[0] {
            0 => Ok(None),
            next => {
                let node = Node::read(pager, next)?;
                Ok(Some((node.key, node.value)))
            }
        }
    }

    /// Remove and return the smallest entry if its key sorts before `bound`
    pub fn consume_first_below(
        &self,
        pager: &mut Pager,
        bound: &[u8],
    ) -> Result<Option<(Vec<u8>, u64)>> {
        let head = Node::read(pager, self.head)?;
        let first = match head.forward[0] {
            0 => return Ok(None),
            next => Node::read(pager, next)?,
        };
        if first.key.as_slice() >= bound {
            return Ok(None);
        }

        // The first node follows the head on every level it has.
        for (level, next) in first.forward.iter().enumerate() {
            pager.write_u64(head.forward_offset(level), *next);
        }
        Ok(Some((first.key, first.value)))
    }

    /// All entries in key order
    pub fn entries(&self, pager: &Pager) -> Result<Vec<(Vec<u8>, u64)>> {
        let mut entries = Vec::new();
        let mut next = Node::read(pager, self.head)?.forward[0];
        while next != 0 {
            let node = Node::read(pager, next)?;
            if let Some((last, _)) = entries.last() {
                if *last >= node.key {
                    return Err(BlobError::Corruption(format!(
                        "skip list out of order at {}",
                        next
                    )));
                }
            }
            next = node.forward[0];
            entries.push((node.key, node.value));
        }
        Ok(entries)
    }

    /// Predecessors of `key` on every level, and the node after the level 0
    /// predecessor.
    fn search(&self, pager: &Pager, key: &[u8]) -> Result<(Vec<Link>, Option<Node>)> {
        let mut update = Vec::with_capacity(MAX_LEVEL);
        let mut current = Node::read(pager, self.head)?;
        let mut candidate = None;

        for level in (0..MAX_LEVEL).rev() {
            loop {
                let next = current.forward[level];
                if next == 0 {
                    candidate = None;
                    break;
                }
                let node = Node::read(pager, next)?;
                if node.key.as_slice() < key {
                    current = node;
                } else {
                    candidate = Some(node);
                    break;
                }
            }
            update.push(Link {
                forward_at: current.forward_offset(level),
                forward_next: current.forward[level],
            });
        }

        update.reverse();
        Ok((update, candidate))
    }
}

/// A forward pointer that may need to be redirected
#[derive(Debug, Clone, Copy)]
struct Link {
    forward_at: u64,
    forward_next: u64,
}

fn random_level() -> usize {
    let mut level = 1;
    let mut rng = rand::thread_rng();
    while level < MAX_LEVEL && rng.gen_ratio(1, BRANCHING_FACTOR) {
        level += 1;
    }
    level
}
