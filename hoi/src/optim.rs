use std::marker::PhantomData;

use burn::{lr_scheduler::{step::{StepLrScheduler, StepLrSchedulerConfig}, LrScheduler}, module::{AutodiffModule, ModuleVisitor, Param, ParamId}, optim::{adaptor::OptimizerAdaptor, AdamW, AdamWConfig, GradientsParams, Optimizer}, tensor::{backend::AutodiffBackend, ElementConversion, Tensor}};

use crate::{config::HoiConfig, distributed::ModelHandle, error::{HoiError, Result}};

const BACKBONE: &str = "backbone";
const LR_GAMMA: f64 = 0.1;

/// Trainable parameters split into the backbone group and everything else.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamGroups {
    pub backbone: Vec<ParamId>,
    pub rest: Vec<ParamId>,
    pub backbone_numel: usize,
    pub rest_numel: usize,
    pub frozen_numel: usize,
}

impl ParamGroups {
    pub fn partition<B: AutodiffBackend, M: AutodiffModule<B>>(module: &M) -> Self {
        let mut collector = GroupCollector::<B> {
            path: Vec::new(),
            groups: ParamGroups::default(),
            backend: PhantomData,
        };
        module.visit(&mut collector);
        collector.groups
    }

    /// Number of parameters that require grad.
    pub fn trainable_numel(&self) -> usize {
        self.backbone_numel + self.rest_numel
    }
}

/// Number of parameters that require grad.
pub fn count_trainable<B: AutodiffBackend, M: AutodiffModule<B>>(module: &M) -> usize {
    ParamGroups::partition::<B, M>(module).trainable_numel()
}

struct GroupCollector<B> {
    path: Vec<String>,
    groups: ParamGroups,
    backend: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GroupCollector<B> {
    fn enter_module(&mut self, name: &str, _container_type: &str) {
        self.path.push(name.to_string());
    }

    fn exit_module(&mut self, _name: &str, _container_type: &str) {
        self.path.pop();
    }

    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        let numel = param.lazy_shape().num_elements();
        if !param.val().is_require_grad() {
            self.groups.frozen_numel += numel;
            return;
        }
        if self.path.join(".").contains(BACKBONE) {
            self.groups.backbone.push(param.id);
            self.groups.backbone_numel += numel;
        } else {
            self.groups.rest.push(param.id);
            self.groups.rest_numel += numel;
        }
    }
}

struct GradNorm<'a, B> {
    grads: &'a GradientsParams,
    sq_sum: f64,
    backend: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradNorm<'_, B> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        if let Some(grad) = self.grads.get::<B::InnerBackend, D>(param.id) {
            self.sq_sum += grad.square().sum().into_scalar().elem::<f64>();
        }
    }
}

struct GradScale<'a, B> {
    grads: &'a mut GradientsParams,
    scale: f64,
    backend: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradScale<'_, B> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        if let Some(grad) = self.grads.remove::<B::InnerBackend, D>(param.id) {
            self.grads.register::<B::InnerBackend, D>(param.id, grad.mul_scalar(self.scale));
        }
    }
}

/// Clips the total L2 norm over every group to `max_norm`, returns the norm before clipping.
pub fn clip_grad_norm<B: AutodiffBackend, M: AutodiffModule<B>>(module: &M, groups: &mut [GradientsParams], max_norm: f64) -> f64 {
    let mut sq_sum = 0.0;
    for grads in groups.iter() {
        let mut norm = GradNorm::<B> { grads, sq_sum: 0.0, backend: PhantomData };
        module.visit(&mut norm);
        sq_sum += norm.sq_sum;
    }
    let total_norm = sq_sum.sqrt();

    let clip_coef = max_norm / (total_norm + 1e-6);
    if clip_coef < 1.0 {
        for grads in groups.iter_mut() {
            let mut scale = GradScale::<B> { grads, scale: clip_coef, backend: PhantomData };
            module.visit(&mut scale);
        }
    }
    total_norm
}

pub type OptimizerRecord<B, M> = <OptimizerAdaptor<AdamW, M, B> as Optimizer<M, B>>::Record;

/// AdamW over the backbone/rest groups with a step-decay schedule applied to both learning rates.
pub struct HoiOptimizer<B: AutodiffBackend, M: AutodiffModule<B>> {
    optim: OptimizerAdaptor<AdamW, M, B>,
    scheduler: StepLrScheduler,
    groups: ParamGroups,
    lr: f64,
    lr_backbone: f64,
    factor: f64,
}

impl<B: AutodiffBackend, M: AutodiffModule<B>> HoiOptimizer<B, M> {
    pub fn new(config: &HoiConfig, groups: ParamGroups) -> Result<Self> {
        let optim = AdamWConfig::new()
            .with_epsilon(1e-8)
            .with_weight_decay(config.weight_decay as f32)
            .init::<B, M>();
        let mut scheduler = StepLrSchedulerConfig::new(1.0, config.lr_drop)
            .with_gamma(LR_GAMMA)
            .init()
            .map_err(HoiError::Config)?;
        let factor = scheduler.step();

        Ok(Self {
            optim,
            scheduler,
            groups,
            lr: config.lr,
            lr_backbone: config.lr_backbone,
            factor,
        })
    }

    pub fn groups(&self) -> &ParamGroups {
        &self.groups
    }

    /// Loading a module record replaces parameter ids, so groups are rebuilt afterwards.
    pub fn set_groups(&mut self, groups: ParamGroups) {
        self.groups = groups;
    }

    /// Current `(lr, lr_backbone)`.
    pub fn learning_rates(&self) -> (f64, f64) {
        (self.lr * self.factor, self.lr_backbone * self.factor)
    }

    pub fn scheduler_step(&mut self) {
        self.factor = self.scheduler.step();
    }

    pub fn scheduler_iteration(&self) -> i32 {
        self.scheduler.to_record::<B>()
    }

    pub fn load_scheduler_iteration(&mut self, iteration: i32) {
        // Rewind one iteration so the replayed step yields the stored factor.
        self.scheduler = self.scheduler.clone().load_record::<B>(iteration.max(0) - 1);
        self.factor = self.scheduler.step();
    }

    pub fn to_record(&self) -> OptimizerRecord<B, M> {
        self.optim.to_record()
    }

    pub fn load_record(&mut self, record: OptimizerRecord<B, M>) {
        self.optim = self.optim.clone().load_record(record);
    }

    /// Applies one update from `grads`. Returns the gradient norm when clipping is enabled.
    pub fn step(&mut self, model: &mut ModelHandle<M>, mut grads: B::Gradients, clip_max_norm: f64) -> Result<Option<f64>> {
        let view = model.distributed();
        let rest = GradientsParams::from_params(&mut grads, view.module(), &self.groups.rest);
        let backbone = GradientsParams::from_params(&mut grads, view.module(), &self.groups.backbone);
        let mut groups = [view.reduce(rest)?, view.reduce(backbone)?];

        let grad_norm = (clip_max_norm > 0.0).then(|| clip_grad_norm::<B, M>(view.module(), &mut groups, clip_max_norm));
        let [rest, backbone] = groups;

        let (lr, lr_backbone) = self.learning_rates();
        let optim = &mut self.optim;
        model.update(|module| {
            let module = if rest.is_empty() { module } else { optim.step(lr, module, rest) };
            Ok(if backbone.is_empty() { module } else { optim.step(lr_backbone, module, backbone) })
        })?;
        Ok(grad_norm)
    }
}

#[cfg(test)]
mod tests {
    use burn::{backend::{Autodiff, NdArray}, module::Module, nn::{Linear, LinearConfig}, tensor::{backend::Backend, Tensor}};

    use super::*;

    type TestBackend = Autodiff<NdArray<f32>>;

    #[derive(Module, Debug)]
    struct Tiny<B: Backend> {
        backbone: Linear<B>,
        head: Linear<B>,
    }

    impl<B: Backend> Tiny<B> {
        fn new(device: &B::Device) -> Self {
            Self {
                backbone: LinearConfig::new(4, 3).init(device),
                head: LinearConfig::new(3, 2).init(device),
            }
        }

        fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
            self.head.forward(self.backbone.forward(x))
        }
    }

    fn config(lr_drop: usize) -> HoiConfig {
        HoiConfig { lr: 0.1, lr_backbone: 0.01, lr_drop, ..HoiConfig::default() }
    }

    #[test]
    fn partition_splits_by_module_path() {
        let device = Default::default();
        let groups = ParamGroups::partition::<TestBackend, _>(&Tiny::<TestBackend>::new(&device));
        assert_eq!(groups.backbone.len(), 2);
        assert_eq!(groups.rest.len(), 2);
        assert_eq!(groups.backbone_numel, 4 * 3 + 3);
        assert_eq!(groups.rest_numel, 3 * 2 + 2);
        assert_eq!(groups.trainable_numel(), 23);
    }

    #[test]
    fn partition_skips_frozen_parameters() {
        let device = Default::default();
        let model = Tiny::<TestBackend>::new(&device);
        let model = Tiny { backbone: model.backbone.no_grad(), head: model.head };
        let groups = ParamGroups::partition::<TestBackend, _>(&model);
        assert!(groups.backbone.is_empty());
        assert_eq!(groups.frozen_numel, 15);
        assert_eq!(groups.trainable_numel(), 8);
        assert_eq!(count_trainable::<TestBackend, _>(&model), 8);
    }

    #[test]
    fn step_decay_multiplies_both_groups() {
        let mut optim = HoiOptimizer::<TestBackend, Tiny<TestBackend>>::new(&config(2), ParamGroups::default()).unwrap();
        assert_eq!(optim.learning_rates(), (0.1, 0.01));
        optim.scheduler_step();
        assert_eq!(optim.learning_rates(), (0.1, 0.01));
        optim.scheduler_step();
        let (lr, lr_backbone) = optim.learning_rates();
        assert!((lr - 0.01).abs() < 1e-12);
        assert!((lr_backbone - 0.001).abs() < 1e-12);
        assert_eq!(optim.scheduler_iteration(), 2);
    }

    #[test]
    fn scheduler_iteration_restores_factor() {
        let mut optim = HoiOptimizer::<TestBackend, Tiny<TestBackend>>::new(&config(1), ParamGroups::default()).unwrap();
        optim.load_scheduler_iteration(2);
        assert_eq!(optim.scheduler_iteration(), 2);
        assert!((optim.learning_rates().0 - 0.001).abs() < 1e-12);
    }

    #[test]
    fn zero_lr_drop_is_rejected() {
        let result = HoiOptimizer::<TestBackend, Tiny<TestBackend>>::new(&config(0), ParamGroups::default());
        assert!(matches!(result, Err(HoiError::Config(_))));
    }

    #[test]
    fn step_updates_trainable_groups_only() {
        let device = Default::default();
        let model = Tiny::<TestBackend>::new(&device);
        let model = Tiny { backbone: model.backbone.no_grad(), head: model.head };
        let groups = ParamGroups::partition::<TestBackend, _>(&model);
        let backbone_before = model.backbone.weight.val().into_data();
        let head_before = model.head.weight.val().into_data();

        let mut handle = ModelHandle::local(model);
        let mut optim = HoiOptimizer::<TestBackend, Tiny<TestBackend>>::new(&config(40), groups).unwrap();
        let x = Tensor::<TestBackend, 2>::ones([5, 4], &device);
        let grads = handle.raw().forward(x).sum().backward();
        let norm = optim.step(&mut handle, grads, 0.1).unwrap();

        assert!(norm.is_some_and(|norm| norm > 0.0));
        assert_eq!(handle.raw().backbone.weight.val().into_data(), backbone_before);
        assert_ne!(handle.raw().head.weight.val().into_data(), head_before);
        assert_eq!(optim.to_record().len(), 2);
    }

    #[test]
    fn clipping_bounds_total_norm() {
        let device = Default::default();
        let model = Tiny::<TestBackend>::new(&device);
        let x = Tensor::<TestBackend, 2>::ones([8, 4], &device).mul_scalar(10.0);
        let grads = model.forward(x).sum().backward();
        let mut groups = [GradientsParams::from_grads(grads, &model)];

        let before = clip_grad_norm::<TestBackend, _>(&model, &mut groups, 0.5);
        assert!(before > 0.5);
        let after = clip_grad_norm::<TestBackend, _>(&model, &mut groups, f64::MAX);
        assert!((after - 0.5).abs() < 1e-3);
    }
}
