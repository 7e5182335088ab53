use layers::conv::ConvConfig;

/// Structural description of one stack inside a built stage.
///
/// Two stages built from the same arguments report equal layouts, which makes
/// the layout a cheap way to compare constructions without touching weights.
#[derive(Debug, Clone, PartialEq)]
pub struct StackLayout {
    /// Convolutions feeding the stack, in construction order, with their
    /// resolved kernel sizes and paddings.
    pub convs: Vec<ConvConfig>,
    /// Spatial shift applied after each input-stage convolution. Empty for
    /// residual stacks.
    pub spatial_shifts: Vec<Vec<usize>>,
}

impl StackLayout {
    pub fn kernel_sizes(&self) -> Vec<&[usize]> {
        self.convs.iter().map(|c| c.kernel_size.as_slice()).collect()
    }

    pub fn paddings(&self) -> Vec<&[(usize, usize)]> {
        self.convs.iter().map(|c| c.padding.as_slice()).collect()
    }
}
