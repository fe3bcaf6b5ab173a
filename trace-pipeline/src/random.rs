//! Random test case generation
//!
//! Produces a fixed number of distinct random test cases of equal length.

use crate::config::{parse_options, RandomTestcaseConfig};
use crate::stage::TestcaseStage;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use gdb_tracer::{TraceEntity, TracerError};
use rand::rngs::{OsRng, StdRng};
use rand::{RngCore, SeedableRng};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;

/// Test case stage emitting random byte strings
#[derive(Default)]
pub struct RandomTestcaseGenerator {
    config: Option<RandomTestcaseConfig>,
    rng: Option<StdRng>,
    next_testcase: u64,
    /// Digests of test cases generated so far
    known: HashSet<[u8; 32]>,
}

impl RandomTestcaseGenerator {
    /// Create an uninitialized generator
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure directly from a typed configuration
    pub async fn init_with(&mut self, config: RandomTestcaseConfig) -> Result<()> {
        if config.length < 8 && config.amount > 1u64 << (8 * config.length) {
            bail!(
                "Cannot generate {} distinct testcases of {} bytes",
                config.amount,
                config.length
            );
        }

        tokio::fs::create_dir_all(&config.output_directory)
            .await
            .with_context(|| format!("Failed to create {:?}", config.output_directory))?;

        self.rng = Some(match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(OsRng)?,
        });
        self.config = Some(config);
        self.next_testcase = 0;
        self.known.clear();
        Ok(())
    }
}

#[async_trait]
impl TestcaseStage for RandomTestcaseGenerator {
    async fn init(&mut self, options: &serde_yaml::Value) -> Result<()> {
        let config = parse_options(options).context("Invalid random testcase options")?;
        self.init_with(config).await
    }

    async fn next_testcase(&mut self, cancel: &CancellationToken) -> Result<TraceEntity> {
        let (Some(config), Some(rng)) = (self.config.as_ref(), self.rng.as_mut()) else {
            bail!("Random testcase generator used before init");
        };

        let mut data = vec![0u8; config.length];
        loop {
            rng.fill_bytes(&mut data);
            if self.known.insert(Sha256::digest(&data).into()) {
                break;
            }
        }

        let path = config
            .output_directory
            .join(format!("{}.testcase", self.next_testcase));
        tokio::select! {
            _ = cancel.cancelled() => return Err(TracerError::Cancelled.into()),
            written = tokio::fs::write(&path, &data) => {
                written.with_context(|| format!("Failed to write {:?}", path))?
            }
        }

        let entity = TraceEntity {
            id: self.next_testcase,
            testcase_file_path: path,
        };
        tracing::info!("Testcase #{}", entity.id);
        self.next_testcase += 1;
        Ok(entity)
    }

    fn is_done(&self) -> bool {
        match &self.config {
            Some(config) => self.next_testcase >= config.amount,
            None => true,
        }
    }

    async fn uninit(&mut self) -> Result<()> {
        self.rng = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &std::path::Path, amount: u64, length: usize) -> RandomTestcaseConfig {
        RandomTestcaseConfig {
            amount,
            length,
            output_directory: dir.join("testcases"),
            seed: Some(7),
        }
    }

    #[tokio::test]
    async fn test_generates_requested_amount() {
        let dir = tempfile::tempdir().unwrap();
        let mut generator = RandomTestcaseGenerator::new();
        generator.init_with(config(dir.path(), 3, 16)).await.unwrap();
        let cancel = CancellationToken::new();

        let mut contents = HashSet::new();
        let mut ids = Vec::new();
        while !generator.is_done() {
            let entity = generator.next_testcase(&cancel).await.unwrap();
            let data = std::fs::read(&entity.testcase_file_path).unwrap();
            assert_eq!(data.len(), 16);
            contents.insert(data);
            ids.push(entity.id);
        }

        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(contents.len(), 3);
        assert!(dir.path().join("testcases/2.testcase").exists());
    }

    #[tokio::test]
    async fn test_small_space_is_exhausted_without_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let mut generator = RandomTestcaseGenerator::new();
        generator.init_with(config(dir.path(), 256, 1)).await.unwrap();
        let cancel = CancellationToken::new();

        let mut seen = HashSet::new();
        while !generator.is_done() {
            let entity = generator.next_testcase(&cancel).await.unwrap();
            assert!(seen.insert(std::fs::read(&entity.testcase_file_path).unwrap()));
        }
        assert_eq!(seen.len(), 256);
    }

    #[tokio::test]
    async fn test_impossible_amount_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut generator = RandomTestcaseGenerator::new();
        assert!(generator.init_with(config(dir.path(), 257, 1)).await.is_err());
    }

    #[tokio::test]
    async fn test_seed_is_reproducible() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();

        let mut a = RandomTestcaseGenerator::new();
        a.init_with(config(first.path(), 1, 32)).await.unwrap();
        let mut b = RandomTestcaseGenerator::new();
        b.init_with(config(second.path(), 1, 32)).await.unwrap();

        let ea = a.next_testcase(&cancel).await.unwrap();
        let eb = b.next_testcase(&cancel).await.unwrap();
        assert_eq!(
            std::fs::read(ea.testcase_file_path).unwrap(),
            std::fs::read(eb.testcase_file_path).unwrap()
        );
    }

    #[tokio::test]
    async fn test_uninitialized_generator_is_done() {
        let generator = RandomTestcaseGenerator::new();
        assert!(generator.is_done());
    }
}
