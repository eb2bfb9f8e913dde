pub mod backbone;
pub mod box_ops;
pub mod criterion;
pub mod matcher;
pub mod position_encoding;
pub mod postprocess;
pub mod transformer;

use burn::{config::Config, module::Module, nn::{conv::{Conv2d, Conv2dConfig}, Embedding, EmbeddingConfig, Linear, LinearConfig}, tensor::{activation::{relu, sigmoid, softmax}, backend::Backend, Tensor}};

use crate::{config::{HoiConfig, PositionEmbedding}, error::{HoiError, Result}};

use self::{backbone::{Backbone, BackboneConfig}, position_encoding::{sine_position_embedding, PositionEmbeddingLearned}, transformer::{HoiTransformer, HoiTransformerConfig}};

/// Raw head outputs of one decoder layer.
#[derive(Debug, Clone)]
pub struct HoiPrediction<B: Backend> {
    /// `[N, Q, num_obj_classes + 1]`, the last class is "no object".
    pub obj_logits: Tensor<B, 3>,
    /// `[N, Q, num_verb_classes]`
    pub verb_logits: Tensor<B, 3>,
    /// Normalized cxcywh, `[N, Q, 4]`.
    pub sub_boxes: Tensor<B, 3>,
    pub obj_boxes: Tensor<B, 3>,
    /// `[N, Q, 2]`, present when the matching head is enabled.
    pub matching_logits: Option<Tensor<B, 3>>,
}

#[derive(Debug, Clone)]
pub struct HoiOutput<B: Backend> {
    pub main: HoiPrediction<B>,
    /// Earlier decoder layers, only filled with auxiliary losses on.
    pub aux: Vec<HoiPrediction<B>>,
}

pub(crate) fn host_values<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f32> {
    tensor.into_data().iter::<f32>().collect()
}

/// Host copy of one prediction in probability space, used by matching and post-processing.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionArrays {
    pub images: usize,
    pub queries: usize,
    pub obj_classes: usize,
    pub verb_classes: usize,
    obj_prob: Vec<f32>,
    verb_prob: Vec<f32>,
    sub_boxes: Vec<f32>,
    obj_boxes: Vec<f32>,
    matching_prob: Option<Vec<f32>>,
}

impl PredictionArrays {
    pub fn from_prediction<B: Backend>(prediction: &HoiPrediction<B>) -> Self {
        let [images, queries, obj_classes] = prediction.obj_logits.dims();
        let [_, _, verb_classes] = prediction.verb_logits.dims();
        Self {
            images,
            queries,
            obj_classes,
            verb_classes,
            obj_prob: host_values(softmax(prediction.obj_logits.clone(), 2)),
            verb_prob: host_values(sigmoid(prediction.verb_logits.clone())),
            sub_boxes: host_values(prediction.sub_boxes.clone()),
            obj_boxes: host_values(prediction.obj_boxes.clone()),
            matching_prob: prediction.matching_logits.clone().map(|logits| host_values(softmax(logits, 2))),
        }
    }

    fn row(values: &[f32], width: usize, row: usize) -> &[f32] {
        &values[row * width..(row + 1) * width]
    }

    /// Object class probabilities, "no object" included.
    pub fn obj_prob(&self, image: usize, query: usize) -> &[f32] {
        Self::row(&self.obj_prob, self.obj_classes, image * self.queries + query)
    }

    pub fn verb_prob(&self, image: usize, query: usize) -> &[f32] {
        Self::row(&self.verb_prob, self.verb_classes, image * self.queries + query)
    }

    pub fn sub_box(&self, image: usize, query: usize) -> &[f32] {
        Self::row(&self.sub_boxes, 4, image * self.queries + query)
    }

    pub fn obj_box(&self, image: usize, query: usize) -> &[f32] {
        Self::row(&self.obj_boxes, 4, image * self.queries + query)
    }

    pub fn matching_prob(&self, image: usize, query: usize) -> Option<&[f32]> {
        self.matching_prob.as_deref().map(|values| Self::row(values, 2, image * self.queries + query))
    }
}

/// Feed-forward box head.
#[derive(Module, Debug)]
pub struct Mlp<B: Backend> {
    layers: Vec<Linear<B>>,
}

impl<B: Backend> Mlp<B> {
    pub fn new(input_dim: usize, hidden_dim: usize, output_dim: usize, num_layers: usize, device: &B::Device) -> Self {
        let layers = (0..num_layers)
            .map(|i| {
                let d_input = if i == 0 { input_dim } else { hidden_dim };
                let d_output = if i + 1 == num_layers { output_dim } else { hidden_dim };
                LinearConfig::new(d_input, d_output).init(device)
            })
            .collect();
        Self { layers }
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let last = self.layers.len().saturating_sub(1);
        self.layers.iter().enumerate().fold(x, |x, (i, layer)| {
            let x = layer.forward(x);
            if i < last { relu(x) } else { x }
        })
    }
}

/// Detection transformer predicting subject-verb-object triplets per query.
#[derive(Module, Debug)]
pub struct DetrHoi<B: Backend> {
    backbone: Backbone<B>,
    input_proj: Conv2d<B>,
    learned_position: Option<PositionEmbeddingLearned<B>>,
    transformer: HoiTransformer<B>,
    query_embed: Embedding<B>,
    obj_class_embed: Linear<B>,
    verb_class_embed: Linear<B>,
    sub_bbox_embed: Mlp<B>,
    obj_bbox_embed: Mlp<B>,
    matching_embed: Option<Linear<B>>,
    hidden_dim: usize,
    aux_loss: bool,
}

impl<B: Backend> DetrHoi<B> {
    fn predict(&self, instance: Tensor<B, 3>, interaction: Tensor<B, 3>) -> HoiPrediction<B> {
        HoiPrediction {
            obj_logits: self.obj_class_embed.forward(instance.clone()),
            verb_logits: self.verb_class_embed.forward(interaction.clone()),
            sub_boxes: sigmoid(self.sub_bbox_embed.forward(instance.clone())),
            obj_boxes: sigmoid(self.obj_bbox_embed.forward(instance)),
            matching_logits: self.matching_embed.as_ref().map(|head| head.forward(interaction)),
        }
    }

    /// `images` is `[N, 3, H, W]`, already normalized.
    pub fn forward(&self, images: Tensor<B, 4>) -> HoiOutput<B> {
        let device = images.device();
        let features = self.backbone.forward(images);
        let src = self.input_proj.forward(features);
        let [_, _, height, width] = src.dims();
        let src = src.flatten::<3>(2, 3).swap_dims(1, 2);

        let pos = match &self.learned_position {
            Some(embed) => embed.forward(height, width),
            None => sine_position_embedding(height, width, self.hidden_dim, &device),
        };
        let out = self.transformer.forward(src, pos, self.query_embed.weight.val());

        let mut instance = out.instance;
        let last = instance.pop().unwrap_or_else(|| out.interaction.clone());
        let main = self.predict(last, out.interaction);
        let aux = if self.aux_loss {
            instance.into_iter().map(|state| self.predict(state.clone(), state)).collect()
        } else {
            Vec::new()
        };
        HoiOutput { main, aux }
    }
}

#[derive(Config, Debug)]
pub struct DetrHoiConfig {
    pub backbone: BackboneConfig,
    pub transformer: HoiTransformerConfig,
    pub hidden_dim: usize,
    pub num_obj_classes: usize,
    pub num_verb_classes: usize,
    pub num_queries: usize,
    #[config(default = true)]
    pub aux_loss: bool,
    #[config(default = false)]
    pub use_matching: bool,
    #[config(default = false)]
    pub learned_position: bool,
    /// Largest feature-map side the learned position embedding has to cover.
    #[config(default = 50)]
    pub max_feature_size: usize,
    #[config(default = false)]
    pub freeze_backbone: bool,
    #[config(default = false)]
    pub freeze_encoder: bool,
    /// Only the prediction heads receive gradients.
    #[config(default = false)]
    pub heads_only: bool,
}

impl DetrHoiConfig {
    pub fn from_hoi(config: &HoiConfig, image_size: usize) -> Result<Self> {
        let unsupported = [
            ("split_query", config.split_query),
            ("interact_query", config.interact_query),
            ("load_bottleneck_dec_ca_weights", config.load_bottleneck_dec_ca_weights),
        ];
        if let Some((name, _)) = unsupported.iter().find(|(_, enabled)| *enabled) {
            return Err(HoiError::Config(format!("`{name}` is not supported by this model")));
        }

        let stride = if config.dilation { 16 } else { 32 };
        let transformer = HoiTransformerConfig::new(
            config.hidden_dim,
            config.nheads,
            config.nheads_hoi,
            config.dim_feedforward,
            config.dim_feedforward_hoi,
            config.enc_layers,
            config.dec_layers,
        )
        .with_hoi_enc_layers(config.hoi_enc_layers)
        .with_hoi_dec_layers(config.hoi_dec_layers)
        .with_dropout(config.dropout)
        .with_norm_first(config.pre_norm);

        Ok(Self::new(
            BackboneConfig::new(config.backbone.clone()).with_dilation(config.dilation),
            transformer,
            config.hidden_dim,
            config.num_obj_classes,
            config.num_verb_classes,
            config.num_queries,
        )
        .with_aux_loss(config.aux_loss)
        .with_use_matching(config.use_matching)
        .with_learned_position(config.position_embedding == PositionEmbedding::Learned)
        .with_max_feature_size(image_size.div_ceil(stride))
        .with_freeze_backbone(config.freeze_mode >= 1 || config.lr_backbone <= 0.0)
        .with_freeze_encoder(config.freeze_mode >= 2)
        .with_heads_only(config.frozen_weights_path().is_some()))
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<DetrHoi<B>> {
        let mut backbone = self.backbone.init(device)?;
        let mut transformer = self.transformer.init(device)?;
        let d = self.hidden_dim;

        let mut input_proj = Conv2dConfig::new([backbone.num_channels(), d], [1, 1]).init(device);
        let mut query_embed = EmbeddingConfig::new(self.num_queries, d).init(device);
        let mut learned_position = self
            .learned_position
            .then(|| PositionEmbeddingLearned::new(d, self.max_feature_size, device));

        if self.freeze_backbone || self.heads_only {
            backbone = backbone.no_grad();
        }
        if self.freeze_encoder {
            transformer = transformer.freeze_encoder();
        }
        if self.heads_only {
            transformer = transformer.no_grad();
            input_proj = input_proj.no_grad();
            query_embed = query_embed.no_grad();
            learned_position = learned_position.map(|embed| embed.no_grad());
        }

        Ok(DetrHoi {
            backbone,
            input_proj,
            learned_position,
            transformer,
            query_embed,
            obj_class_embed: LinearConfig::new(d, self.num_obj_classes + 1).init(device),
            verb_class_embed: LinearConfig::new(d, self.num_verb_classes).init(device),
            sub_bbox_embed: Mlp::new(d, d, 4, 3, device),
            obj_bbox_embed: Mlp::new(d, d, 4, 3, device),
            matching_embed: self.use_matching.then(|| LinearConfig::new(d, 2).init(device)),
            hidden_dim: d,
            aux_loss: self.aux_loss,
        })
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::{Autodiff, NdArray};

    use super::*;
    use crate::optim::ParamGroups;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn small_config() -> HoiConfig {
        HoiConfig {
            backbone: "resnet18".to_string(),
            hidden_dim: 16,
            nheads: 2,
            nheads_hoi: 2,
            dim_feedforward: 32,
            dim_feedforward_hoi: 32,
            enc_layers: 1,
            dec_layers: 2,
            hoi_enc_layers: 1,
            num_queries: 4,
            num_obj_classes: 3,
            num_verb_classes: 5,
            ..HoiConfig::controller_default()
        }
    }

    #[test]
    fn forward_shapes_and_aux_outputs() {
        let device = Default::default();
        let config = HoiConfig { use_matching: true, ..small_config() };
        let model = DetrHoiConfig::from_hoi(&config, 64).unwrap().init::<TestBackend>(&device).unwrap();
        let out = model.forward(Tensor::zeros([2, 3, 64, 64], &device));

        assert_eq!(out.main.obj_logits.dims(), [2, 4, 4]);
        assert_eq!(out.main.verb_logits.dims(), [2, 4, 5]);
        assert_eq!(out.main.sub_boxes.dims(), [2, 4, 4]);
        assert_eq!(out.main.matching_logits.as_ref().map(|t| t.dims()), Some([2, 4, 2]));
        assert_eq!(out.aux.len(), 1);

        let arrays = PredictionArrays::from_prediction(&out.main);
        let probs = arrays.obj_prob(1, 3);
        assert_eq!(probs.len(), 4);
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-4);
        assert!(arrays.sub_box(0, 0).iter().all(|v| (0.0..=1.0).contains(v)));
        assert!(arrays.matching_prob(0, 0).is_some());
    }

    #[test]
    fn learned_position_and_no_aux() {
        let device = Default::default();
        let config = HoiConfig { aux_loss: false, position_embedding: PositionEmbedding::Learned, ..small_config() };
        let model = DetrHoiConfig::from_hoi(&config, 64).unwrap().init::<TestBackend>(&device).unwrap();
        let out = model.forward(Tensor::zeros([1, 3, 64, 64], &device));
        assert!(out.aux.is_empty());
        assert!(out.main.matching_logits.is_none());
    }

    #[test]
    fn zero_backbone_lr_freezes_backbone() {
        let device = Default::default();
        let config = HoiConfig { lr_backbone: 0.0, ..small_config() };
        let model = DetrHoiConfig::from_hoi(&config, 64).unwrap().init::<TestBackend>(&device).unwrap();
        let groups = ParamGroups::partition::<TestBackend, _>(&model);
        assert!(groups.backbone.is_empty());
        assert!(groups.frozen_numel > 0);
        assert!(!groups.rest.is_empty());
    }

    #[test]
    fn unsupported_query_variants_are_rejected() {
        let config = HoiConfig { split_query: true, ..small_config() };
        assert!(matches!(DetrHoiConfig::from_hoi(&config, 64), Err(HoiError::Config(msg)) if msg.contains("split_query")));
    }

    #[test]
    fn mlp_applies_every_layer() {
        let device = Default::default();
        let mlp = Mlp::<TestBackend>::new(6, 8, 4, 3, &device);
        assert_eq!(mlp.forward(Tensor::ones([2, 3, 6], &device)).dims(), [2, 3, 4]);
    }
}
