use std::path::Path;

use dfw_nn::TensorDataset;
use dfw_tensor::{Shape, Tensor};
use dfw_train::config::{NoiseType, Options};
use dfw_train::curriculum::{next_depth, Curriculum};
use dfw_train::evaluator::{eval_model, evaluate_dataset};
use dfw_train::message::MessageSource;
use dfw_train::schedule::Annealing;
use dfw_train::strategy::{Batch, Strategy, TrainStep, ValidateStep, EVAL_KEYS};
use dfw_train::validate::run_dataset;
use dfw_train::{
    pretrain, save_examples, test, test_per_user, Error, EvalJob, Evaluator, Trainer,
    WatermarkModel,
};

fn tiny_options(dir: &Path) -> Options {
    let mut options = Options::default();
    options.img_size = 4;
    options.channels = 3;
    options.msg_l = 4;
    options.batch_size = 2;
    options.epochs = 3;
    options.annealing_epochs = 2;
    options.save_freq = 1;
    options.n_imgs = 2;
    options.n_users = 3;
    options.noise_type = NoiseType::Identity;
    options.model.hidden = 8;
    options.model.max_depth = 4;
    options.model.pretrain_depth = 4;
    options.data.n_train = 4;
    options.data.n_dev = 2;
    options.data.n_test = 2;
    options.paths.checkpoint = dir.join("dfw.safetensors");
    options.paths.pretrain = dir.join("pretrain.safetensors");
    options.paths.train_log = dir.join("train.log");
    options.paths.test_log = dir.join("test.log");
    options.paths.output_dir = dir.join("out");
    options
}

fn images(n: usize) -> Tensor {
    Tensor::from_fn(Shape::from_slice(&[n, 3, 4, 4]), |i| {
        ((i[0] * 7 + i[1] * 3 + i[2] + 2 * i[3]) % 9) as f64 / 4.5 - 1.0
    })
}

fn logged_epochs(path: &Path) -> Vec<usize> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .filter_map(|line| line.strip_prefix("Epoch "))
        .map(|rest| rest.split(' ').next().unwrap().parse().unwrap())
        .collect()
}

#[test]
fn test_eval_stats_have_the_eight_keys() {
    let dir = tempfile::tempdir().unwrap();
    let options = tiny_options(dir.path());
    let mut model = eval_model(&options);
    let dataset = TensorDataset::new(images(2));
    let mut messages = MessageSource::new(4, 0);
    let stats = evaluate_dataset(&mut model, &dataset, &mut messages, &options).unwrap();

    assert_eq!(stats.len(), 8);
    assert_eq!(stats.keys().collect::<Vec<_>>(), EVAL_KEYS.to_vec());
    for (key, value) in stats.iter() {
        assert!(value.is_finite(), "{key} = {value}");
    }
}

#[test]
fn test_depth_two_with_low_loss_advances_to_four() {
    let curriculum = Curriculum {
        threshold: 0.05,
        pretrain_depth: 5,
        max_attempts: None,
    };
    assert_eq!(curriculum.advance(2, 0.04), 4);
    assert_eq!(next_depth(4), 5);
}

#[test]
fn test_evaluator_logs_epochs_in_submission_order() {
    let dir = tempfile::tempdir().unwrap();
    let options = tiny_options(dir.path());
    let checkpoint = eval_model(&options).state_dict();

    let evaluator = Evaluator::spawn(&options).unwrap();
    for epoch in 0..3 {
        assert!(evaluator.submit(EvalJob {
            epoch,
            checkpoint: checkpoint.clone(),
        }));
    }
    evaluator.shutdown();

    assert_eq!(logged_epochs(&options.paths.test_log), vec![0, 1, 2]);
}

#[test]
fn test_evaluator_survives_a_bad_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let options = tiny_options(dir.path());
    let evaluator = Evaluator::spawn(&options).unwrap();
    evaluator.submit(EvalJob {
        epoch: 0,
        checkpoint: Default::default(),
    });
    // The worker fails on the empty state dict; join must still return.
    evaluator.join();
    evaluator.shutdown();
    assert!(logged_epochs(&options.paths.test_log).is_empty());
}

#[test]
fn test_stats_are_exact_under_rebatching() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = tiny_options(dir.path());
    let dataset = TensorDataset::new(images(4));

    let mut run = |batch_size: usize| {
        options.batch_size = batch_size;
        let mut model = eval_model(&options);
        let mut messages = MessageSource::new(4, 9);
        evaluate_dataset(&mut model, &dataset, &mut messages, &options).unwrap()
    };
    let whole = run(4);
    let pairs = run(2);
    let singles = run(1);
    for key in EVAL_KEYS {
        let w = whole.get(key).unwrap();
        assert!((w - pairs.get(key).unwrap()).abs() < 1e-9, "{key}");
        assert!((w - singles.get(key).unwrap()).abs() < 1e-9, "{key}");
    }
}

#[test]
fn test_checkpoint_round_trip_reproduces_inference() {
    let dir = tempfile::tempdir().unwrap();
    let options = tiny_options(dir.path());
    let mut trained = WatermarkModel::new(&options);
    trained.set_depth(options.model.max_depth);
    let mut step = TrainStep::new(1e-2, 1.0);
    step.set_epoch(&Annealing::new(0.7, 2), 1);
    let batch = Batch::new(images(2), MessageSource::new(4, 1).sample(2));
    for _ in 0..5 {
        step.step(&mut trained, &batch).unwrap();
    }
    trained.save(&options.paths.checkpoint).unwrap();

    let mut other = options.clone();
    other.seed = 99;
    let mut restored = WatermarkModel::new(&other);
    restored.set_depth(options.model.max_depth);
    restored.load(&options.paths.checkpoint).unwrap();

    let msg = MessageSource::new(4, 2).sample(2);
    let a = trained.infer(&images(2), &msg, 1.0);
    let b = restored.infer(&images(2), &msg, 1.0);
    assert_eq!(a.logits.data(), b.logits.data());
    assert_eq!(a.encoded.data(), b.encoded.data());
}

#[test]
fn test_pretrain_grows_monotonically_and_saves() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = tiny_options(dir.path());
    // every step clears the bar
    options.curriculum.threshold = 1e9;
    let report = pretrain(&options).unwrap();

    let depths: Vec<usize> = report.transitions.iter().map(|&(d, _)| d).collect();
    assert_eq!(depths, vec![1, 2, 4]);
    assert!(depths.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(report.steps, 3);
    assert!(report.final_depth <= options.model.max_depth);
    assert!(options.paths.pretrain.exists());
}

#[test]
fn test_overfitting_tiny_dataset_improves_decoding() {
    let dir = tempfile::tempdir().unwrap();
    let options = tiny_options(dir.path());
    let mut model = WatermarkModel::new(&options);
    model.set_depth(2);
    let mut step = TrainStep::new(1e-2, 1.0);
    // epoch 0: no perceptibility penalty, wide clamp
    step.set_epoch(&Annealing::new(0.7, 10), 0);
    let imgs = images(2);
    let msg = Tensor::new(vec![1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0], Shape::from_slice(&[2, 4]));
    let batch = Batch::new(imgs.clone(), msg.clone());

    let accuracy = |model: &mut WatermarkModel| {
        let pass = model.infer(&imgs, &msg, step_limit());
        let right = pass
            .logits
            .data()
            .iter()
            .zip(msg.data())
            .filter(|(z, m)| (**z > 0.0) == (**m > 0.5))
            .count();
        right as f64 / msg.numel() as f64
    };
    let before = accuracy(&mut model);

    let first = step.step(&mut model, &batch).unwrap().get("dec_loss").unwrap();
    let mut last = first;
    for _ in 0..300 {
        last = step.step(&mut model, &batch).unwrap().get("dec_loss").unwrap();
    }
    let after = accuracy(&mut model);

    assert!(last < first, "dec_loss {first} -> {last}");
    assert!(after >= before, "accuracy {before} -> {after}");
}

fn step_limit() -> f64 {
    Annealing::new(0.7, 10).limit(0)
}

#[test]
fn test_missing_checkpoints_are_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let options = tiny_options(dir.path());

    let err = Trainer::new(&options).run().unwrap_err();
    assert!(matches!(err, Error::MissingPretrainCheckpoint(ref p) if *p == options.paths.pretrain));
    assert!(!options.paths.train_log.exists(), "no work before the check");

    assert!(matches!(test(&options), Err(Error::MissingCheckpoint(_))));
    assert!(matches!(test_per_user(&options), Err(Error::MissingCheckpoint(_))));
    assert!(matches!(save_examples(&options), Err(Error::MissingCheckpoint(_))));
}

#[test]
fn test_equal_validation_losses_still_save() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = tiny_options(dir.path());
    options.curriculum.threshold = 1e9;
    options.enc_scale = 0.0;
    options.dec_scale = 0.0;
    pretrain(&options).unwrap();

    let report = Trainer::new(&options).with_evaluator(false).run().unwrap();
    assert!(report.epochs.iter().all(|e| e.validation.get("loss") == Some(0.0)));
    assert_eq!(report.saved_epochs, vec![0, 1, 2]);
    assert_eq!(report.best_val_loss, 0.0);
    let train_log = std::fs::read_to_string(&options.paths.train_log).unwrap();
    assert_eq!(train_log.matches("Validation loss decreased").count(), 3);
}

#[test]
fn test_validation_uses_the_annealed_clamp_limit() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = tiny_options(dir.path());
    options.curriculum.threshold = 1e9;
    options.epochs = 1;
    pretrain(&options).unwrap();

    let report = Trainer::new(&options).with_evaluator(false).run().unwrap();
    let first = &report.epochs[0];
    assert_eq!(first.limit, 5.0);
    // the epoch-0 weights were saved right after validation
    let mut model = WatermarkModel::new(&options);
    model.set_depth(options.model.max_depth);
    model.load(&options.paths.checkpoint).unwrap();
    let dev = dfw_train::dataset::open_split(&options, dfw_train::dataset::Split::Dev).unwrap();
    let mut messages = MessageSource::new(options.msg_l, options.seed.wrapping_add(7 << 16));
    let mut step = ValidateStep {
        enc_scale: options.enc_scale,
        dec_scale: options.dec_scale,
        limit: 5.0,
    };
    let expected = run_dataset(&mut model, &mut step, dev.as_ref(), options.batch_size, |n| {
        messages.sample(n)
    })
    .unwrap();
    assert_eq!(first.validation.get("loss"), expected.get("loss"));
}

#[test]
fn test_pretrain_train_and_offline_passes() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = tiny_options(dir.path());
    options.curriculum.threshold = 1e9;
    pretrain(&options).unwrap();

    let report = Trainer::new(&options).run().unwrap();
    assert_eq!(report.epochs.len(), 3);
    assert_eq!(report.saved_epochs.first(), Some(&0));
    assert!(report.best_val_loss.is_finite());
    assert!(options.paths.checkpoint.exists());
    assert_eq!(report.epochs[0].enc_scale, 0.0);
    assert_eq!(report.epochs[0].limit, 5.0);
    assert_eq!(report.epochs[2].limit, 1.0);

    let train_log = std::fs::read_to_string(&options.paths.train_log).unwrap();
    assert!(train_log.starts_with("Epoch 0 | loss: "));
    assert!(train_log.contains("Validation loss decreased (inf --> "));
    assert_eq!(logged_epochs(&options.paths.test_log), vec![0, 1, 2]);

    let stats = test(&options).unwrap();
    assert_eq!(stats.len(), 8);

    let per_user = test_per_user(&options).unwrap();
    assert_eq!(per_user.stats.len(), 3);
    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&per_user.stats_path).unwrap()).unwrap();
    assert_eq!(json.as_array().unwrap().len(), 3);
    let csv = std::fs::read_to_string(&per_user.users_path).unwrap();
    let rows: Vec<&str> = csv.lines().collect();
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r.split(',').count() == 4));

    let examples = save_examples(&options).unwrap();
    assert_eq!(examples.bit_errors.len(), 2);
    let tensors = dfw_safetensors::load(&examples.dir.join("examples.safetensors")).unwrap();
    for name in ["cover", "watermark", "encoded", "noised", "message", "decoded"] {
        assert!(tensors.contains_key(name), "{name}");
    }
    assert!(tensors["watermark"].max_abs() <= 1.0 + 1e-12);
    let qualitative: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(examples.dir.join("qualitative_eval.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(qualitative.as_object().unwrap().len(), 2);
    assert!(examples.dir.ends_with("examples_identity"));
}
