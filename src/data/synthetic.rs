use ndarray::{Array1, Array2, Array3, Array4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::model::RawDataset;

/// Shape of a generated recording.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticParams {
    pub train_images: usize,
    pub test_images: usize,
    pub neurons: usize,
    /// Neurons are spread round-robin over sessions; a session either saw
    /// an image or not.
    pub sessions: usize,
    pub time_bins: usize,
    pub height: usize,
    pub width: usize,
    /// Probability that a session did not see a given image.
    pub missing_frac: f64,
}

impl Default for SyntheticParams {
    fn default() -> Self {
        Self {
            train_images: 40,
            test_images: 10,
            neurons: 6,
            sessions: 3,
            time_bins: 8,
            height: 20,
            width: 20,
            missing_frac: 0.1,
        }
    }
}

fn gaussian(d2: f64, sigma: f64, amplitude: f64) -> f64 {
    amplitude * (-d2 / (2.0 * sigma.powi(2))).exp()
}

/// Box-Muller transform for normal noise
fn gauss<R: Rng + ?Sized>(rng: &mut R, mean: f64, std_dev: f64) -> f64 {
    let u1: f64 = rng.random::<f64>().max(1e-15);
    let u2: f64 = rng.random();
    let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
    mean + std_dev * z
}

/// Blob stimuli on a grey background, pixel range roughly 0..255.
fn generate_images<R: Rng + ?Sized>(rng: &mut R, n: usize, p: &SyntheticParams) -> Array4<f32> {
    let mut images = Array4::<f32>::zeros((n, p.height, p.width, 1));
    for mut image in images.outer_iter_mut() {
        let blobs: Vec<(f64, f64, f64, f64)> = (0..3)
            .map(|_| {
                (
                    rng.random_range(0.0..p.height as f64),
                    rng.random_range(0.0..p.width as f64),
                    rng.random_range(1.0..4.0),
                    rng.random_range(-100.0..100.0),
                )
            })
            .collect();
        for ((y, x, _), px) in image.indexed_iter_mut() {
            let signal: f64 = blobs
                .iter()
                .map(|&(cy, cx, sigma, amp)| {
                    let d2 = (y as f64 - cy).powi(2) + (x as f64 - cx).powi(2);
                    gaussian(d2, sigma, amp)
                })
                .sum();
            *px = (128.0 + signal + gauss(rng, 0.0, 5.0)).clamp(0.0, 255.0) as f32;
        }
    }
    images
}

/// Each neuron reads its receptive-field pixel and responds with a
/// transient peaking a few bins after onset. Sessions that did not see an
/// image leave NaN for all their neurons.
fn generate_responses<R: Rng + ?Sized>(
    rng: &mut R,
    images: &Array4<f32>,
    rf: &[(usize, usize)],
    session_of: &[usize],
    p: &SyntheticParams,
) -> Array3<f32> {
    let n = images.shape()[0];
    let mut responses = Array3::<f32>::zeros((n, p.neurons, p.time_bins));
    for i in 0..n {
        let seen: Vec<bool> = (0..p.sessions.max(1))
            .map(|_| !rng.random_bool(p.missing_frac.clamp(0.0, 1.0)))
            .collect();
        for (neuron, &(y, x)) in rf.iter().enumerate() {
            let drive = (f64::from(images[[i, y, x, 0]]) - 128.0).max(0.0) / 32.0;
            for t in 0..p.time_bins {
                responses[[i, neuron, t]] = if seen[session_of[neuron]] {
                    let rate = drive * gaussian((t as f64 - 3.0).powi(2), 1.5, 1.0);
                    (rate + gauss(rng, 0.0, 0.1)).max(0.0).round() as f32
                } else {
                    f32::NAN
                };
            }
        }
    }
    responses
}

/// Build a reproducible recording for demos and tests.
pub fn generate(params: &SyntheticParams, seed: u64) -> RawDataset {
    let mut rng = StdRng::seed_from_u64(seed);
    let sessions = params.sessions.max(1);

    let session_of: Vec<usize> = (0..params.neurons).map(|n| n % sessions).collect();
    let rf: Vec<(usize, usize)> = (0..params.neurons)
        .map(|_| {
            (
                rng.random_range(params.height / 4..params.height - params.height / 4),
                rng.random_range(params.width / 4..params.width - params.width / 4),
            )
        })
        .collect();

    let images_train = generate_images(&mut rng, params.train_images, params);
    let images_test = generate_images(&mut rng, params.test_images, params);
    let responses_train = generate_responses(&mut rng, &images_train, &rf, &session_of, params);
    let responses_test = generate_responses(&mut rng, &images_test, &rf, &session_of, params);

    let session_ids = Array1::from_iter(session_of.iter().map(|&s| s as i64));
    let subject_ids = session_ids.mapv(|s| s % 2);
    let link = Array2::from_shape_fn((params.neurons, 3), |(n, c)| match c {
        0 => session_of[n] as i64,
        1 => (n / sessions) as i64,
        _ => n as i64,
    });
    let repetitions: Array1<i64> =
        Array1::from_iter((0..params.test_images).map(|_| rng.random_range(1..=4)));

    RawDataset {
        subject_ids: subject_ids.into_dyn(),
        session_ids: session_ids.into_dyn(),
        session_unit_response_link: link.into_dyn(),
        repetitions_test: repetitions.into_dyn(),
        responses_train,
        responses_test,
        images_train,
        images_test,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_record_is_consistent() {
        let params = SyntheticParams::default();
        let raw = generate(&params, 42);
        assert!(raw.validate().is_ok());
        assert_eq!(raw.images_train.shape(), &[40, 20, 20, 1]);
        assert_eq!(raw.responses_test.shape(), &[10, 6, 8]);
        assert_eq!(raw.session_unit_response_link.shape(), &[6, 3]);
    }

    #[test]
    fn same_seed_same_record() {
        let params = SyntheticParams::default();
        let (a, b) = (generate(&params, 7), generate(&params, 7));
        assert_eq!(a.images_train, b.images_train);
        // NaN != NaN, compare masks and the filled values
        assert_eq!(a.responses_train.mapv(f32::is_nan), b.responses_train.mapv(f32::is_nan));
        assert_eq!(
            a.responses_train.mapv(|v| if v.is_nan() { -1.0 } else { v }),
            b.responses_train.mapv(|v| if v.is_nan() { -1.0 } else { v })
        );
    }

    #[test]
    fn whole_sessions_go_missing() {
        let params = SyntheticParams {
            missing_frac: 0.5,
            ..SyntheticParams::default()
        };
        let raw = generate(&params, 3);
        for image in raw.responses_train.outer_iter() {
            for neuron in image.outer_iter() {
                let missing = neuron.iter().filter(|v| v.is_nan()).count();
                assert!(missing == 0 || missing == params.time_bins);
            }
        }
    }
}
