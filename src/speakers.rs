use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::GlowTtsTrainingConfig;
use crate::dataset::TtsItem;
use crate::errors::{Result, TrainError};

/// File name of the mapping saved next to checkpoints
pub const SPEAKERS_FILE: &str = "speakers.json";

/// Precomputed embedding of one clip, keyed by clip name in the mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakerEmbedding {
    pub name: String,
    pub embedding: Vec<f32>,
}

/// Speaker conditioning lookup, immutable once training starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SpeakerMapping {
    /// Clip name to precomputed embedding
    Embeddings(BTreeMap<String, SpeakerEmbedding>),
    /// Speaker name to embedding-layer index
    Ids(BTreeMap<String, usize>),
}

impl SpeakerMapping {
    /// Assign ids to the sorted, unique speaker names
    pub fn from_speakers(speakers: &[String]) -> Self {
        let ids = speakers
            .iter()
            .enumerate()
            .map(|(id, name)| (name.clone(), id))
            .collect();
        SpeakerMapping::Ids(ids)
    }

    pub fn len(&self) -> usize {
        match self {
            SpeakerMapping::Embeddings(map) => map.len(),
            SpeakerMapping::Ids(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn speaker_id(&self, name: &str) -> Option<usize> {
        match self {
            SpeakerMapping::Ids(map) => map.get(name).copied(),
            SpeakerMapping::Embeddings(_) => None,
        }
    }

    pub fn embedding(&self, clip_name: &str) -> Option<&[f32]> {
        match self {
            SpeakerMapping::Embeddings(map) => map.get(clip_name).map(|e| e.embedding.as_slice()),
            SpeakerMapping::Ids(_) => None,
        }
    }

    /// Embedding length, `None` in id mode
    pub fn embedding_dim(&self) -> Option<usize> {
        match self {
            SpeakerMapping::Embeddings(map) => map.values().next().map(|e| e.embedding.len()),
            SpeakerMapping::Ids(_) => None,
        }
    }

    pub fn contains_speaker(&self, name: &str) -> bool {
        match self {
            SpeakerMapping::Ids(map) => map.contains_key(name),
            SpeakerMapping::Embeddings(map) => map.values().any(|e| e.name == name),
        }
    }

    /// Load a mapping from a JSON file, or from `speakers.json` inside a directory
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let file_path = if path.is_dir() {
            path.join(SPEAKERS_FILE)
        } else {
            path.to_path_buf()
        };
        if !file_path.exists() {
            return Ok(None);
        }
        let reader = BufReader::new(File::open(&file_path)?);
        let mapping = serde_json::from_reader(reader)?;
        Ok(Some(mapping))
    }

    pub fn save(&self, out_dir: &Path) -> Result<PathBuf> {
        let path = out_dir.join(SPEAKERS_FILE);
        let writer = BufWriter::new(File::create(&path)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(path)
    }
}

/// Speaker setup derived from the config and the training metadata
#[derive(Debug, Clone, Default)]
pub struct SpeakerSetup {
    pub num_speakers: usize,
    pub embedding_dim: Option<usize>,
    pub mapping: Option<Arc<SpeakerMapping>>,
}

/// Sorted unique speaker names of the metadata
pub fn get_speakers(items: &[TtsItem]) -> Vec<String> {
    let mut speakers: Vec<String> = items.iter().map(|item| item.speaker_name.clone()).collect();
    speakers.sort();
    speakers.dedup();
    speakers
}

/// Resolve the speaker mapping for a new or restored run and save it to `out_path`
pub fn parse_speakers(
    config: &GlowTtsTrainingConfig,
    restore_path: Option<&Path>,
    train_items: &[TtsItem],
    out_path: &Path,
) -> Result<SpeakerSetup> {
    if !config.use_speaker_embedding {
        return Ok(SpeakerSetup::default());
    }

    let speakers = get_speakers(train_items);
    let external_file = config.external_speaker_embedding_file.as_deref().map(Path::new);

    let mapping = match (restore_path, config.use_external_speaker_embedding_file) {
        (Some(restore), true) => {
            let prev_out_path = restore.parent().unwrap_or(restore);
            match SpeakerMapping::load(prev_out_path)? {
                Some(mapping) => mapping,
                None => {
                    println!(
                        "WARNING: {} was not found next to the restore path, trying the external embedding file",
                        SPEAKERS_FILE
                    );
                    external_file
                        .map(SpeakerMapping::load)
                        .transpose()?
                        .flatten()
                        .ok_or_else(|| {
                            TrainError::Speakers(format!(
                                "copy {} next to the restore path or set a valid external_speaker_embedding_file",
                                SPEAKERS_FILE
                            ))
                        })?
                }
            }
        }
        (Some(restore), false) => {
            let prev_out_path = restore.parent().unwrap_or(restore);
            let mapping = SpeakerMapping::load(prev_out_path)?.ok_or_else(|| {
                TrainError::Speakers(format!(
                    "{} not found in {}",
                    SPEAKERS_FILE,
                    prev_out_path.display()
                ))
            })?;
            if let Some(unknown) = speakers.iter().find(|s| !mapping.contains_speaker(s)) {
                return Err(TrainError::Speakers(format!(
                    "speaker '{}' is new, speakers cannot be added to a previously trained model",
                    unknown
                )));
            }
            mapping
        }
        (None, true) => {
            let file = external_file.ok_or_else(|| {
                TrainError::Speakers(
                    "use_external_speaker_embedding_file is set but no external_speaker_embedding_file was given"
                        .to_string(),
                )
            })?;
            SpeakerMapping::load(file)?.ok_or_else(|| {
                TrainError::Speakers(format!("embedding file {} not found", file.display()))
            })?
        }
        (None, false) => SpeakerMapping::from_speakers(&speakers),
    };

    if config.use_external_speaker_embedding_file && mapping.embedding_dim().is_none() {
        return Err(TrainError::Speakers(
            "external speaker file does not contain embeddings".to_string(),
        ));
    }

    mapping.save(out_path)?;
    println!("Training with {} speakers: {}", speakers.len(), speakers.join(", "));

    Ok(SpeakerSetup {
        num_speakers: mapping.len(),
        embedding_dim: mapping.embedding_dim(),
        mapping: Some(Arc::new(mapping)),
    })
}

#[cfg(all(test, feature = "ndarray"))]
mod tests {
    use super::*;
    use crate::testing::item;
    use tempfile::TempDir;

    fn speaker_config() -> GlowTtsTrainingConfig {
        GlowTtsTrainingConfig::recipe().with_use_speaker_embedding(true)
    }

    #[test]
    fn test_disabled_returns_no_mapping() {
        let dir = TempDir::new().unwrap();
        let config = GlowTtsTrainingConfig::recipe();
        let setup = parse_speakers(&config, None, &[item("abc", "bob", 4)], dir.path()).unwrap();
        assert_eq!(setup.num_speakers, 0);
        assert!(setup.mapping.is_none());
        assert!(!dir.path().join(SPEAKERS_FILE).exists());
    }

    #[test]
    fn test_new_run_assigns_sorted_ids() {
        let dir = TempDir::new().unwrap();
        let items = vec![item("abc", "zoe", 4), item("abd", "adam", 4), item("abe", "zoe", 4)];
        let setup = parse_speakers(&speaker_config(), None, &items, dir.path()).unwrap();

        let mapping = setup.mapping.unwrap();
        assert_eq!(setup.num_speakers, 2);
        assert_eq!(mapping.speaker_id("adam"), Some(0));
        assert_eq!(mapping.speaker_id("zoe"), Some(1));
        assert_eq!(SpeakerMapping::load(dir.path()).unwrap().as_ref(), Some(&*mapping));
    }

    #[test]
    fn test_restore_rejects_new_speakers() {
        let prev = TempDir::new().unwrap();
        SpeakerMapping::from_speakers(&["adam".to_string()]).save(prev.path()).unwrap();
        let restore = prev.path().join("checkpoint_10");

        let out = TempDir::new().unwrap();
        let items = vec![item("abc", "adam", 4), item("abd", "eve", 4)];
        let result = parse_speakers(&speaker_config(), Some(&restore), &items, out.path());
        assert!(matches!(result, Err(TrainError::Speakers(_))));
    }

    #[test]
    fn test_external_embeddings_set_dim() {
        let dir = TempDir::new().unwrap();
        let mut map = BTreeMap::new();
        map.insert(
            "clip_1".to_string(),
            SpeakerEmbedding { name: "adam".to_string(), embedding: vec![0.1, 0.2, 0.3] },
        );
        let file = dir.path().join("embeddings.json");
        serde_json::to_writer(File::create(&file).unwrap(), &SpeakerMapping::Embeddings(map)).unwrap();

        let config = speaker_config()
            .with_use_external_speaker_embedding_file(true)
            .with_external_speaker_embedding_file(Some(file.display().to_string()));
        let out = TempDir::new().unwrap();
        let setup = parse_speakers(&config, None, &[item("abc", "adam", 4)], out.path()).unwrap();
        assert_eq!(setup.embedding_dim, Some(3));
        assert_eq!(setup.mapping.unwrap().embedding("clip_1"), Some(&[0.1, 0.2, 0.3][..]));
    }

    #[test]
    fn test_external_mode_requires_file() {
        let out = TempDir::new().unwrap();
        let config = speaker_config().with_use_external_speaker_embedding_file(true);
        let result = parse_speakers(&config, None, &[item("abc", "adam", 4)], out.path());
        assert!(result.is_err());
    }
}
