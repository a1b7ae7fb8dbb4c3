/// Poor man's approx assertion for matrices
#[macro_export]
macro_rules! assert_approx_matrix_eq {
    ($x:expr, $y:expr, abstol = $tol:expr) => {{
        let diff = $x - $y;

        let max_absdiff = diff.abs().max();
        let approx_eq = max_absdiff <= $tol;

        if !approx_eq {
            println!("abstol: {:e}", $tol);
            println!("left: {}", $x);
            println!("right: {}", $y);
            println!("diff: {:e}", diff);
        }
        assert!(approx_eq);
    }};
}

/// Approx assertion for scalar slices, reporting the first offending entry.
#[macro_export]
macro_rules! assert_approx_slice_eq {
    ($x:expr, $y:expr, abstol = $tol:expr) => {{
        let x: &[_] = $x;
        let y: &[_] = $y;
        assert_eq!(x.len(), y.len(), "Slices must have the same length.");
        for (i, (xi, yi)) in x.iter().zip(y.iter()).enumerate() {
            let absdiff = (xi - yi).abs();
            if !(absdiff <= $tol) {
                panic!(
                    "assert_approx_slice_eq! failed at index {}: left = {:?}, right = {:?}, \
                     |diff| = {:e} > abstol = {:e}",
                    i, xi, yi, absdiff, $tol
                );
            }
        }
    }};
}

#[macro_export]
macro_rules! assert_panics {
    ($e:expr) => {{
        use std::panic::catch_unwind;
        use std::stringify;
        let expr_string = stringify!($e);
        let result = catch_unwind(|| $e);
        if result.is_ok() {
            panic!("assert_panics!({}) failed.", expr_string);
        }
    }};
}
