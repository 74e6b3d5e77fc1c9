// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use car_builder::{BuilderConfig, CarBlock, CarBuilder, CarLocation, CarStream};
use cid::Cid;
use futures::TryStreamExt as _;
use rand::{RngCore as _, SeedableRng as _};
use rand_chacha::ChaCha8Rng;

pub fn builder() -> CarBuilder {
    CarBuilder::new(BuilderConfig::default()).unwrap()
}

/// Reproducible pseudo-random content.
pub fn random_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut bytes = vec![0; len];
    ChaCha8Rng::seed_from_u64(seed).fill_bytes(&mut bytes);
    bytes
}

pub fn car_bytes(location: &CarLocation) -> Vec<u8> {
    match location {
        CarLocation::File(path) => std::fs::read(path).unwrap(),
        CarLocation::Memory(bytes) => bytes.clone(),
    }
}

/// Parses an archive, checking every block against its CID.
pub async fn read_car(car: &[u8]) -> (Cid, Vec<CarBlock>) {
    let stream = CarStream::new(car).await.unwrap();
    let roots: Vec<Cid> = stream.header.roots.iter().copied().collect();
    assert_eq!(roots.len(), 1);
    let blocks: Vec<CarBlock> = stream.try_collect().await.unwrap();
    for block in &blocks {
        block.validate().unwrap();
    }
    (roots[0], blocks)
}
