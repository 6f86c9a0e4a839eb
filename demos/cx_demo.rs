use cx_leverage::{CxConfig, CxDecomposition, PartitionedRowMatrix, SelectionScheme};
use ndarray::{Array, Array2};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

fn main() {
    // A 200 x 40 matrix of exact rank 6, split into partitions of 32 rows
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let u: Array2<f64> = Array::random_using((200, 6), StandardNormal, &mut rng);
    let v: Array2<f64> = Array::random_using((6, 40), StandardNormal, &mut rng);
    let matrix = PartitionedRowMatrix::from_dense(u.dot(&v), 32).expect("partitioning failed");

    let cx = CxDecomposition::new(&matrix, CxConfig::default()).expect("invalid configuration");

    for scheme in [SelectionScheme::Deterministic, SelectionScheme::Randomized] {
        let output = cx.run(6, 4, scheme, 12).expect("CX decomposition failed");
        println!("scheme: {}", scheme);
        println!("  selected indices: {:?}", output.selection.indices());
        println!(
            "  distinct rows: {} (rank {})",
            output.extracted.len(),
            output.error.selection_rank
        );
        println!(
            "  reconstruction error: {:.3e} (relative {:.3e})",
            output.error.frobenius_error, output.error.relative_error
        );
    }
}
