#![no_std]

const HEAP_SIZE: usize = 4 * 1024 * 1024;

#[global_allocator]
static ALLOCATOR: segalloc::Allocator<HEAP_SIZE> = segalloc::Allocator::new();

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

#[test]
fn vectors_grow_through_the_allocator() {
    let mut primes = alloc::vec![2_u32, 3, 5];
    for candidate in 6..100 {
        if primes.iter().all(|p| candidate % p != 0) {
            primes.push(candidate);
        }
    }
    assert_eq!(primes.len(), 25);
    assert_eq!(primes.last(), Some(&97));
}

#[test]
fn growing_and_shrinking_a_vector() {
    // `Vec` growth and `shrink_to_fit` both go through
    // `GlobalAlloc::realloc`, exercising the in-place paths of the heap.
    let mut v = Vec::new();
    for i in 0..10_000_u64 {
        v.push(i);
    }
    v.truncate(16);
    v.shrink_to_fit();

    assert_eq!(v.iter().sum::<u64>(), 120);
}

#[test]
fn tree_maps_and_strings() {
    let sentence = "the quick brown fox jumps over the lazy dog";
    let mut index: BTreeMap<String, usize> = BTreeMap::new();
    for (position, word) in sentence.split(' ').enumerate() {
        index.entry(String::from(word)).or_insert(position);
    }

    assert_eq!(index.len(), 8);
    assert_eq!(index["the"], 0);
    assert_eq!(index["dog"], 8);
}
