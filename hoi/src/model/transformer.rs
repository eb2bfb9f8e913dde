use burn::{config::Config, module::Module, nn::transformer::{TransformerDecoder, TransformerDecoderConfig, TransformerDecoderInput, TransformerEncoder, TransformerEncoderConfig, TransformerEncoderInput}, tensor::{backend::Backend, Tensor}};

use crate::error::{HoiError, Result};

#[derive(Config, Debug)]
pub struct HoiTransformerConfig {
    pub d_model: usize,
    pub n_heads: usize,
    pub n_heads_hoi: usize,
    pub d_ff: usize,
    pub d_ff_hoi: usize,
    pub enc_layers: usize,
    pub dec_layers: usize,
    #[config(default = 0)]
    pub hoi_enc_layers: usize,
    #[config(default = 0)]
    pub hoi_dec_layers: usize,
    #[config(default = 0.1)]
    pub dropout: f64,
    #[config(default = false)]
    pub norm_first: bool,
}

impl HoiTransformerConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<HoiTransformer<B>> {
        if self.dec_layers == 0 {
            return Err(HoiError::Config("dec_layers must be greater than 0".to_string()));
        }
        let encoder = |n_heads: usize, d_ff: usize, n_layers: usize| {
            (n_layers > 0).then(|| {
                TransformerEncoderConfig::new(self.d_model, d_ff, n_heads, n_layers)
                    .with_dropout(self.dropout)
                    .with_norm_first(self.norm_first)
                    .init(device)
            })
        };
        let decoder = |n_heads: usize, d_ff: usize, n_layers: usize| {
            TransformerDecoderConfig::new(self.d_model, d_ff, n_heads, n_layers)
                .with_dropout(self.dropout)
                .with_norm_first(self.norm_first)
                .init(device)
        };

        Ok(HoiTransformer {
            encoder: encoder(self.n_heads, self.d_ff, self.enc_layers),
            hoi_encoder: encoder(self.n_heads_hoi, self.d_ff_hoi, self.hoi_enc_layers),
            decoder_layers: (0..self.dec_layers).map(|_| decoder(self.n_heads, self.d_ff, 1)).collect(),
            hoi_decoder: (self.hoi_dec_layers > 0).then(|| decoder(self.n_heads_hoi, self.d_ff_hoi, self.hoi_dec_layers)),
        })
    }
}

/// Decoder states, one `[N, Q, D]` tensor per decoder layer.
#[derive(Debug, Clone)]
pub struct TransformerOutput<B: Backend> {
    pub instance: Vec<Tensor<B, 3>>,
    /// Interaction states fed to the verb and matching heads.
    pub interaction: Tensor<B, 3>,
}

#[derive(Module, Debug)]
pub struct HoiTransformer<B: Backend> {
    encoder: Option<TransformerEncoder<B>>,
    hoi_encoder: Option<TransformerEncoder<B>>,
    decoder_layers: Vec<TransformerDecoder<B>>,
    hoi_decoder: Option<TransformerDecoder<B>>,
}

impl<B: Backend> HoiTransformer<B> {
    /// Stops gradients through both encoders.
    pub fn freeze_encoder(self) -> Self {
        Self {
            encoder: self.encoder.map(|encoder| encoder.no_grad()),
            hoi_encoder: self.hoi_encoder.map(|encoder| encoder.no_grad()),
            ..self
        }
    }

    /// `src` is `[N, S, D]`, `pos` is `[1, S, D]`, `query_embed` is `[Q, D]`.
    pub fn forward(&self, src: Tensor<B, 3>, pos: Tensor<B, 3>, query_embed: Tensor<B, 2>) -> TransformerOutput<B> {
        let [batch_size, _, _] = src.dims();
        let pos = pos.repeat_dim(0, batch_size);

        let mut memory = src + pos.clone();
        if let Some(encoder) = &self.encoder {
            memory = encoder.forward(TransformerEncoderInput::new(memory));
        }
        if let Some(hoi_encoder) = &self.hoi_encoder {
            memory = hoi_encoder.forward(TransformerEncoderInput::new(memory + pos));
        }

        let mut target = query_embed.unsqueeze_dim::<3>(0).repeat_dim(0, batch_size);
        let mut instance = Vec::with_capacity(self.decoder_layers.len());
        for layer in &self.decoder_layers {
            target = layer.forward(TransformerDecoderInput::new(target, memory.clone()));
            instance.push(target.clone());
        }

        let interaction = match &self.hoi_decoder {
            Some(hoi_decoder) => hoi_decoder.forward(TransformerDecoderInput::new(target, memory)),
            None => target,
        };
        TransformerOutput { instance, interaction }
    }
}
