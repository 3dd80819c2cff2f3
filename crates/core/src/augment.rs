//! Geometric test-time augmentation over NCHW batches.
//!
//! The eight transforms form the dihedral group of the square: optional
//! transpose followed by optional vertical and horizontal flips. Every
//! transform commutes with uniform spatial scaling, so the inverse can be
//! applied to a scaled network output directly.

use ndarray::{Array4, ArrayView4, Axis};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Augmentation {
    transpose: bool,
    flip_v: bool,
    flip_h: bool,
}

impl Augmentation {
    pub const IDENTITY: Self = Self {
        transpose: false,
        flip_v: false,
        flip_h: false,
    };

    pub fn all() -> [Self; 8] {
        let mut out = [Self::IDENTITY; 8];
        for (i, aug) in out.iter_mut().enumerate() {
            *aug = Self {
                transpose: i & 4 != 0,
                flip_v: i & 2 != 0,
                flip_h: i & 1 != 0,
            };
        }
        out
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::IDENTITY
    }

    /// Transform an input batch.
    pub fn apply(&self, input: ArrayView4<'_, f32>) -> Array4<f32> {
        let mut view = input;
        if self.transpose {
            view = view.permuted_axes([0, 1, 3, 2]);
        }
        if self.flip_v {
            view.invert_axis(Axis(2));
        }
        if self.flip_h {
            view.invert_axis(Axis(3));
        }
        view.as_standard_layout().into_owned()
    }

    /// Undo [`apply`](Self::apply) on a (possibly scaled) output batch.
    pub fn invert(&self, output: ArrayView4<'_, f32>) -> Array4<f32> {
        let mut view = output;
        if self.flip_h {
            view.invert_axis(Axis(3));
        }
        if self.flip_v {
            view.invert_axis(Axis(2));
        }
        if self.transpose {
            view = view.permuted_axes([0, 1, 3, 2]);
        }
        view.as_standard_layout().into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(h: usize, w: usize) -> Array4<f32> {
        Array4::from_shape_fn((2, 3, h, w), |(n, c, y, x)| {
            (n * 1000 + c * 100 + y * 10 + x) as f32
        })
    }

    #[test]
    fn eight_distinct_transforms() {
        let all = Augmentation::all();
        assert!(all[0].is_identity());
        let input = ramp(3, 4);
        let outputs: Vec<Array4<f32>> = all.iter().map(|a| a.apply(input.view())).collect();
        for i in 0..outputs.len() {
            for j in i + 1..outputs.len() {
                assert_ne!(outputs[i], outputs[j], "transforms {i} and {j} coincide");
            }
        }
    }

    #[test]
    fn invert_undoes_apply() {
        let input = ramp(3, 5);
        for aug in Augmentation::all() {
            let transformed = aug.apply(input.view());
            assert_eq!(aug.invert(transformed.view()), input);
        }
    }

    #[test]
    fn transpose_swaps_spatial_axes() {
        let input = ramp(2, 7);
        let aug = Augmentation::all()[4];
        let out = aug.apply(input.view());
        assert_eq!(out.shape(), &[2, 3, 7, 2]);
        assert_eq!(out[[0, 0, 6, 1]], input[[0, 0, 1, 6]]);
    }

    #[test]
    fn flips_mirror_the_right_axis() {
        let input = ramp(2, 3);
        let h = Augmentation::all()[1].apply(input.view());
        assert_eq!(h[[0, 0, 0, 0]], input[[0, 0, 0, 2]]);
        let v = Augmentation::all()[2].apply(input.view());
        assert_eq!(v[[0, 0, 0, 0]], input[[0, 0, 1, 0]]);
    }
}
