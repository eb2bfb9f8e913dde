use std::f64::consts::PI;

use burn::{module::Module, nn::{Embedding, EmbeddingConfig}, tensor::{backend::Backend, Tensor, TensorData}};

const TEMPERATURE: f64 = 10000.0;
const MIN_LEARNED_SIZE: usize = 50;

/// Normalized sine/cosine embedding of an `height x width` grid, shape `[1, height * width, dim]`.
///
/// The first half of the channels encodes the row, the second half the column. Even channels hold
/// the sine and odd channels the cosine of the same frequency.
pub fn sine_position_embedding<B: Backend>(height: usize, width: usize, dim: usize, device: &B::Device) -> Tensor<B, 3> {
    let num_pos_feats = dim / 2;
    let dim_t: Vec<f64> = (0..num_pos_feats)
        .map(|i| TEMPERATURE.powf((2 * (i / 2)) as f64 / num_pos_feats as f64))
        .collect();
    let eps = 1e-6;

    let encode = |position: f64, size: usize, out: &mut Vec<f32>| {
        let embed = position / (size as f64 + eps) * 2.0 * PI;
        for (i, t) in dim_t.iter().enumerate() {
            let value = embed / t;
            out.push(if i % 2 == 0 { value.sin() } else { value.cos() } as f32);
        }
    };

    let mut values = Vec::with_capacity(height * width * num_pos_feats * 2);
    for y in 0..height {
        for x in 0..width {
            encode((y + 1) as f64, height, &mut values);
            encode((x + 1) as f64, width, &mut values);
        }
    }
    Tensor::from_data(TensorData::new(values, [1, height * width, num_pos_feats * 2]), device)
}

/// Absolute embedding learned per row and per column.
#[derive(Module, Debug)]
pub struct PositionEmbeddingLearned<B: Backend> {
    row_embed: Embedding<B>,
    col_embed: Embedding<B>,
}

impl<B: Backend> PositionEmbeddingLearned<B> {
    /// `max_size` is the largest feature side expected; at least 50 entries are allocated.
    pub fn new(dim: usize, max_size: usize, device: &B::Device) -> Self {
        let entries = max_size.max(MIN_LEARNED_SIZE);
        Self {
            row_embed: EmbeddingConfig::new(entries, dim / 2).init(device),
            col_embed: EmbeddingConfig::new(entries, dim / 2).init(device),
        }
    }

    pub fn forward(&self, height: usize, width: usize) -> Tensor<B, 3> {
        let [_, half] = self.col_embed.weight.val().dims();
        let x_emb = self.col_embed.weight.val().narrow(0, 0, width);
        let y_emb = self.row_embed.weight.val().narrow(0, 0, height);

        let x_emb = x_emb.unsqueeze_dim::<3>(0).repeat_dim(0, height);
        let y_emb = y_emb.unsqueeze_dim::<3>(1).repeat_dim(1, width);
        Tensor::cat(vec![x_emb, y_emb], 2).reshape([1, height * width, half * 2])
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;

    use super::*;

    type TestBackend = NdArray<f32>;

    #[test]
    fn sine_embedding_layout() {
        let device = Default::default();
        let pos = sine_position_embedding::<TestBackend>(2, 3, 8, &device);
        assert_eq!(pos.dims(), [1, 6, 8]);

        let values: Vec<f32> = pos.into_data().iter::<f32>().collect();
        // cell (0, 0): first row channel is sin(1 / 2 * 2pi) = sin(pi)
        assert!(values[0].abs() < 1e-4);
        assert!((values[1] + 1.0).abs() < 1e-4);
        // cell (0, 1) shares the row half with cell (0, 0)
        assert_eq!(&values[0..4], &values[8..12]);
        assert_ne!(&values[4..8], &values[12..16]);
    }

    #[test]
    fn learned_embedding_concatenates_column_then_row() {
        let device = Default::default();
        let embed = PositionEmbeddingLearned::<TestBackend>::new(8, 4, &device);
        let pos = embed.forward(3, 5);
        assert_eq!(pos.dims(), [1, 15, 8]);

        let col: Vec<f32> = embed.col_embed.weight.val().narrow(0, 2, 1).into_data().iter::<f32>().collect();
        let row: Vec<f32> = embed.row_embed.weight.val().narrow(0, 1, 1).into_data().iter::<f32>().collect();
        // cell (1, 2) sits at flat index 1 * 5 + 2
        let cell: Vec<f32> = pos.narrow(1, 7, 1).into_data().iter::<f32>().collect();
        assert_eq!(&cell[..4], col.as_slice());
        assert_eq!(&cell[4..], row.as_slice());
    }
}
