use std::path::Path;

use cfaraw_core::dataset::PairedDataset;
use cfaraw_core::device::Device;
use cfaraw_core::error::DatasetError;
use cfaraw_core::loader::{load_images, LoadOptions};
use cfaraw_core::loss::LossKind;
use cfaraw_core::model::{Denoiser, DenoisingAutoencoder};
use cfaraw_core::report::{load_model, save_losses, save_model, ArtifactPaths};
use cfaraw_core::train::{train, TrainOptions};
use cfaraw_core::validate::validate;
use image::{Rgb, RgbImage};
use ndarray::Array2;
use ndarray_npy::write_npy;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tempfile::tempdir;

fn write_gradient_png(path: &Path, size: u32, offset: u8) {
    let img = RgbImage::from_fn(size, size, |x, y| {
        let v = ((x + y) as u8).wrapping_add(offset);
        Rgb([v, v / 2, 255 - v])
    });
    img.save(path).expect("write png");
}

#[test]
fn stacks_follow_file_name_order() {
    let dir = tempdir().expect("tempdir");
    for (name, value) in [("b.png", 20u8), ("a.png", 10), ("c.png", 30)] {
        RgbImage::from_pixel(4, 4, Rgb([value; 3]))
            .save(dir.path().join(name))
            .expect("write png");
    }

    let stack = load_images(dir.path(), &LoadOptions::new("png")).expect("load");
    let firsts: Vec<f32> = (0..stack.len())
        .map(|i| stack.data[[i, 0, 0, 0]] * 256.0)
        .collect();
    assert_eq!(firsts, vec![10.0, 20.0, 30.0]);
}

#[test]
fn raw_mosaics_above_one_are_divided_by_256_without_clamping() {
    let dir = tempdir().expect("tempdir");
    let mut mosaic = Array2::<u16>::from_elem((4, 4), 100);
    mosaic[[1, 2]] = 300;
    write_npy(dir.path().join("frame.npy"), &mosaic).expect("write npy");

    let stack = load_images(dir.path(), &LoadOptions::new("npy").with_expand(true))
        .expect("load");

    assert_eq!(stack.sample_shape(), [3, 4, 4]);
    assert!((stack.data[[0, 0, 1, 2]] - 300.0 / 256.0).abs() < 1e-6);
    assert!((stack.data[[0, 0, 0, 0]] - 100.0 / 256.0).abs() < 1e-6);
    assert_eq!(stack.data[[0, 1, 1, 2]], 0.0);
}

#[test]
fn empty_directory_is_a_dataset_error() {
    let dir = tempdir().expect("tempdir");
    let err = load_images(dir.path(), &LoadOptions::new("png")).expect_err("empty");
    assert!(matches!(
        err.downcast_ref::<DatasetError>(),
        Some(DatasetError::Empty { .. })
    ));
}

#[test]
fn train_save_reload_and_validate() {
    let root = tempdir().expect("tempdir");
    let clean_dir = root.path().join("clean");
    let noisy_dir = root.path().join("noisy");
    std::fs::create_dir_all(&clean_dir).expect("clean dir");
    std::fs::create_dir_all(&noisy_dir).expect("noisy dir");
    for i in 0..4u8 {
        write_gradient_png(&clean_dir.join(format!("{i}.png")), 64, i * 10);
        write_gradient_png(&noisy_dir.join(format!("{i}.png")), 64, i * 10 + 3);
    }

    let options = LoadOptions::new("png").with_device(Device::Accelerator);
    let clean = load_images(&clean_dir, &options).expect("load clean");
    let noisy = load_images(&noisy_dir, &options).expect("load noisy");
    assert_eq!(clean.sample_shape(), [3, 64, 64]);

    let dataset = PairedDataset::new(&clean, &noisy)
        .expect("pair")
        .with_crop_augment(true)
        .expect("augment");
    let mut train_options = TrainOptions::new(1, LossKind::L2);
    train_options.training.batch_size = 4;

    let mut rng = StdRng::seed_from_u64(11);
    let model = DenoisingAutoencoder::new(3, 4, &mut rng);
    let outcome = train(model, &dataset, &train_options, Device::Cpu, &mut rng).expect("train");

    assert_eq!(outcome.epochs.len(), 1);
    assert_eq!(outcome.epochs[0].batches, 1);
    assert!(outcome.non_finite.is_empty());

    let paths = ArtifactPaths::new(&root.path().join("out"), "smoke");
    save_model(&outcome.model, &paths.model).expect("save model");
    let mut reloaded = load_model(&paths.model).expect("load model");

    let losses = validate(&reloaded, &clean, &noisy, 3, Device::Cpu).expect("validate");
    assert_eq!(losses.len(), 2);
    assert!(losses.iter().all(|loss| loss.is_finite() && *loss >= 0.0));

    // Validation reads the model only; the training flag does not change it.
    reloaded.set_training(true);
    let in_training_mode =
        validate(&reloaded, &clean, &noisy, 3, Device::Cpu).expect("validate again");
    assert_eq!(in_training_mode, losses);
    assert!(reloaded.is_training());

    save_losses(&losses, &paths.losses).expect("save losses");
    let written = std::fs::read_to_string(&paths.losses).expect("read losses");
    assert_eq!(written.lines().count(), 2);
}
