//! Integration tests for keyword spotting
//!
//! These tests run the full pipeline over small synthetic corpora written to
//! temporary directories: WAV files in, dataset JSON, trained model, and
//! predictions out.

use std::f32::consts::PI;
use std::path::Path;

use keyword_spotting::audio::save_wav;

/// Sine tone at 22.05 kHz with a little per-clip detuning
fn tone(len: usize, freq: f32, variant: usize) -> Vec<f32> {
    let freq = freq * (1.0 + variant as f32 * 0.01);
    (0..len)
        .map(|i| (2.0 * PI * freq * i as f32 / 22050.0).sin() * 0.5)
        .collect()
}

/// Corpus root with `clips` clips per category
fn write_corpus(root: &Path, categories: &[(&str, f32)], clips: usize) {
    for (category, freq) in categories {
        let dir = root.join(category);
        std::fs::create_dir_all(&dir).unwrap();
        for i in 0..clips {
            save_wav(dir.join(format!("{i:02}.wav")), &tone(22050 + i * 100, *freq, i), 22050)
                .unwrap();
        }
    }
}

mod audio_tests {
    use super::*;
    use keyword_spotting::audio::{load_clip, AudioBuffer, AudioNormalizer, MfccExtractor};
    use keyword_spotting::config::FeatureConfig;
    use keyword_spotting::KwsError;

    #[test]
    fn test_feature_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.wav");
        save_wav(&path, &tone(30000, 440.0, 0), 22050).unwrap();

        let audio = load_clip(&path, 22050).unwrap();
        assert_eq!(audio.len(), 30000);

        let clip = AudioNormalizer::default().normalize(audio).unwrap();
        assert_eq!(clip.len(), 22050);

        let features = MfccExtractor::new(FeatureConfig::default()).extract(&clip);
        assert_eq!(features.shape(), (44, 13));
        assert!(features.is_finite());
    }

    #[test]
    fn test_other_sample_rates_are_resampled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.wav");
        let samples: Vec<f32> = (0..17000)
            .map(|i| (2.0 * PI * 440.0 * i as f32 / 16000.0).sin() * 0.5)
            .collect();
        save_wav(&path, &samples, 16000).unwrap();

        let audio = load_clip(&path, 22050).unwrap();
        assert_eq!(audio.sample_rate, 22050);
        assert!(AudioNormalizer::default().normalize(audio).is_ok());
    }

    #[test]
    fn test_short_clip_rejected_before_extraction() {
        let err = AudioNormalizer::default()
            .normalize(AudioBuffer::new(vec![0.1; 22049], 22050))
            .unwrap_err();
        assert!(matches!(
            err,
            KwsError::InsufficientAudio {
                actual: 22049,
                required: 22050
            }
        ));
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let extractor = MfccExtractor::new(FeatureConfig::default());
        let clip = AudioNormalizer::default()
            .normalize_samples(&tone(22050, 700.0, 3), 22050)
            .unwrap();
        assert_eq!(extractor.extract(&clip), extractor.extract(&clip));
    }
}

mod dataset_tests {
    use super::*;
    use keyword_spotting::{Dataset, DatasetBuilder};

    #[test]
    fn test_dataset_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = dir.path().join("dataset");
        write_corpus(&corpus, &[("go", 600.0), ("down", 300.0)], 3);
        std::fs::write(corpus.join("go").join("notes.wav"), b"not a wav").unwrap();

        let dataset = DatasetBuilder::default().build(&corpus).unwrap();
        assert_eq!(dataset.len(), 6);
        assert_eq!(dataset.labels, vec![0, 0, 0, 1, 1, 1]);
        assert_eq!(dataset.class_counts(), vec![3, 3]);

        let json_path = dir.path().join("data.json");
        dataset.save(&json_path).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&json_path).unwrap()).unwrap();
        assert_eq!(raw["mapping"], serde_json::json!(["down", "go"]));
        assert_eq!(raw["labels"].as_array().unwrap().len(), 6);
        assert_eq!(raw["MFCCs"][0].as_array().unwrap().len(), 44);
        assert_eq!(raw["MFCCs"][0][0].as_array().unwrap().len(), 13);
        assert_eq!(raw["files"].as_array().unwrap().len(), 6);

        let loaded = Dataset::load(&json_path).unwrap();
        assert_eq!(loaded, dataset);
    }
}

mod model_tests {
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};
    use keyword_spotting::models::{keyword_cnn, KeywordCnn, Shape};

    #[test]
    fn test_model_construction() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = KeywordCnn::new(Shape::Spatial(1, 44, 13), &keyword_cnn(11), vb).unwrap();
        assert_eq!(model.num_classes(), 11);

        let xs = Tensor::randn(0f32, 1.0, (4, 1, 44, 13), &Device::Cpu).unwrap();
        let probs = model.forward(&xs).unwrap();
        assert_eq!(probs.dims(), &[4, 11]);
        let sums: Vec<f32> = probs.sum(1).unwrap().to_vec1().unwrap();
        assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-4));
    }

    #[test]
    fn test_smaller_vocabulary() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = KeywordCnn::new(Shape::Spatial(1, 44, 13), &keyword_cnn(3), vb).unwrap();
        let xs = Tensor::zeros((1, 1, 44, 13), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(model.forward(&xs).unwrap().dims(), &[1, 3]);
    }
}

mod end_to_end {
    use super::*;
    use candle_core::Device;
    use keyword_spotting::config::KEYWORDS;
    use keyword_spotting::training::train_from_file;
    use keyword_spotting::{
        DatasetBuilder, KeywordSpotter, KeywordSpottingService, KwsConfig, KwsError, Prediction,
    };
    use std::sync::Arc;

    #[test]
    fn test_prepare_train_predict() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = dir.path().join("dataset");
        write_corpus(&corpus, &[("happy", 900.0), ("down", 300.0), ("go", 600.0)], 8);

        let json_path = dir.path().join("data.json");
        DatasetBuilder::default()
            .build(&corpus)
            .unwrap()
            .save(&json_path)
            .unwrap();

        let mut config = KwsConfig::default();
        config.model_path = dir.path().join("out").join("model.safetensors");
        config.training.epochs = 2;
        config.training.batch_size = 8;
        config.training.seed = Some(7);

        let report = train_from_file(config.clone(), Device::Cpu, &json_path).unwrap();
        assert_eq!(report.test_examples, 3);
        assert_eq!(report.validation_examples, 3);
        assert_eq!(report.train_examples, 18);
        assert_eq!(report.history.len(), 2);
        assert!(report.test.loss.is_finite());
        assert!((0.0..=1.0).contains(&report.test.accuracy));

        let service = Arc::new(KeywordSpottingService::new(config.clone(), Device::Cpu));
        assert!(!service.is_ready());

        let clip = corpus.join("go").join("03.wav");
        let prediction = service.predict(&clip).unwrap();
        assert!(service.is_ready());
        assert!(KEYWORDS.contains(&prediction.label().unwrap()));
        assert_eq!(service.predict(&clip).unwrap(), prediction);

        let short = dir.path().join("short.wav");
        save_wav(&short, &tone(10000, 600.0, 0), 22050).unwrap();
        assert_eq!(service.predict(&short).unwrap(), Prediction::FileTooSmall);

        // A second spotter over the same artifact agrees with the service
        let spotter = KeywordSpotter::load(&config, Device::Cpu).unwrap();
        assert_eq!(spotter.predict(&clip).unwrap(), prediction);
    }

    #[test]
    fn test_service_without_model() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = KwsConfig::default();
        config.model_path = dir.path().join("model.safetensors");
        let service = KeywordSpottingService::new(config, Device::Cpu);
        let err = service.initialize().err().unwrap();
        assert!(matches!(
            err.downcast_ref::<KwsError>(),
            Some(KwsError::MissingModelArtifact(_))
        ));
    }

    #[test]
    fn test_unordered_corpus_is_refused_for_training() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = dir.path().join("dataset");
        // Sorted, "yes" would take label 0, which belongs to "down"
        write_corpus(&corpus, &[("yes", 500.0), ("zero", 800.0)], 5);
        let dataset = DatasetBuilder::default().build(&corpus).unwrap();

        let mut config = KwsConfig::default();
        config.model_path = dir.path().join("model.safetensors");
        let trainer = keyword_spotting::Trainer::new(config.clone(), Device::Cpu).unwrap();
        let err = trainer.train(&dataset).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<KwsError>(),
            Some(KwsError::ConfigMismatch(_))
        ));
        assert!(!config.model_path.exists());
    }
}
