// THEORY:
// The `histogram` module holds the appearance model: three colour planes of
// sixteen bins each. Two instances exist at any time, the *target model*
// (built once from the first frame) and the *candidate* (rebuilt from the
// current region every frame). The weight of a pixel is the ratio of the two
// at that pixel's bins.
//
// Two constructions are available, chosen once per tracker:
// 1.  **Single pixel** (the default): only the region's centre pixel is
//     sampled and one unit of mass lands in that pixel's bin of each plane.
//     A single memory access per frame, and the whole histogram change can be
//     described by three bin indices, which is what lets the accelerator keep
//     its own copy in sync through a 32-bit notification.
// 2.  **Epanechnikov**: every pixel of the region contributes its normalised
//     kernel mass, `1 - r^2` inside the ellipse inscribed in the region and
//     nothing outside it. One unit of mass is spread over the whole region.
//     Such a histogram cannot be described by an index update, so it is only
//     usable when the weight field is computed entirely on the host.
//
// Every cell is seeded strictly positive so the ratio never divides by zero.

use crate::core_modules::numeric::Numeric;
use crate::core_modules::region::TrackedRegion;
use crate::error::{TrackingError, TrackingResult};
use image::RgbImage;

pub const PLANES: usize = 3;
pub const BIN_COUNT: usize = 16;
pub const CHANNEL_RANGE: usize = 256;
/// `log2(CHANNEL_RANGE / BIN_COUNT)`; right-shifting a channel value by this
/// amount yields its bin.
pub const BIN_SHIFT: u32 = (CHANNEL_RANGE / BIN_COUNT).trailing_zeros();

/// Maps an 8-bit channel value to its bin.
#[inline]
pub fn quantize(value: u8) -> u8 {
    value >> BIN_SHIFT
}

/// Maps a raw buffer sample to its bin. Samples outside the 8-bit range land
/// in the last bin.
#[inline]
pub fn quantize_sample(sample: u32) -> usize {
    ((sample >> BIN_SHIFT) as usize).min(BIN_COUNT - 1)
}

/// How a histogram is built from a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HistogramKind {
    #[default]
    SinglePixel,
    Epanechnikov,
}

impl HistogramKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "single" | "single-pixel" | "pixel" => Some(HistogramKind::SinglePixel),
            "epanechnikov" | "kernel" => Some(HistogramKind::Epanechnikov),
            _ => None,
        }
    }

    /// Whether the accelerator can mirror the histogram from index updates.
    pub fn is_mirrored(self) -> bool {
        self == HistogramKind::SinglePixel
    }
}

/// Which of the two histograms a change refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistogramRole {
    Model,
    Candidate,
}

/// The bins of one sampled pixel, one per plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BinTriple([u8; PLANES]);

impl BinTriple {
    /// Validates that every index addresses an existing bin.
    pub fn new(bins: [u8; PLANES]) -> TrackingResult<Self> {
        match bins.iter().find(|&&bin| bin as usize >= BIN_COUNT) {
            Some(&bad) => Err(TrackingError::BinOutOfRange(bad)),
            None => Ok(Self(bins)),
        }
    }

    pub fn from_pixel(channels: [u8; PLANES]) -> Self {
        Self(channels.map(quantize))
    }

    pub fn bins(&self) -> [u8; PLANES] {
        self.0
    }

    pub fn bin(&self, plane: usize) -> usize {
        self.0[plane] as usize
    }
}

/// Per-plane bin masses.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramModel<N: Numeric> {
    cells: [[N; BIN_COUNT]; PLANES],
}

impl<N: Numeric> HistogramModel<N> {
    /// A histogram with every cell at the backend's seed value.
    pub fn seeded() -> Self {
        Self {
            cells: [[N::seed(); BIN_COUNT]; PLANES],
        }
    }

    /// A seeded histogram with one unit added at each of `bins`.
    pub fn from_bins(bins: BinTriple) -> Self {
        let mut model = Self::seeded();
        model.increment(bins);
        model
    }

    /// Samples the centre pixel of `region` and returns the resulting
    /// histogram together with the sampled bins.
    pub fn build(frame: &RgbImage, region: &TrackedRegion) -> TrackingResult<(Self, BinTriple)> {
        let (cx, cy) = region.center();
        if cx < 0 || cy < 0 || cx >= frame.width() as i64 || cy >= frame.height() as i64 {
            return Err(TrackingError::RegionOutOfBounds {
                region: *region,
                frame_width: frame.width(),
                frame_height: frame.height(),
            });
        }
        let pixel = frame.get_pixel(cx as u32, cy as u32);
        let bins = BinTriple::from_pixel(pixel.0);
        Ok((Self::from_bins(bins), bins))
    }

    /// Spreads one unit of mass over every pixel of `region`, weighted by the
    /// Epanechnikov profile of its position.
    pub fn build_kernel(frame: &RgbImage, region: &TrackedRegion) -> TrackingResult<Self> {
        if !region.fits_within(frame.width(), frame.height()) {
            return Err(TrackingError::RegionOutOfBounds {
                region: *region,
                frame_width: frame.width(),
                frame_height: frame.height(),
            });
        }
        let kernel = epanechnikov_profile(region.width as usize, region.height as usize);
        let kernel_sum: f64 = kernel.iter().sum();
        if kernel_sum <= 0.0 {
            return Err(TrackingError::degenerate(format!(
                "region {region} has no kernel mass"
            )));
        }

        let mut model = Self::seeded();
        let (x0, y0) = (region.x as u32, region.y as u32);
        for (row, profile) in kernel.chunks_exact(region.width as usize).enumerate() {
            for (col, &k) in profile.iter().enumerate() {
                if k == 0.0 {
                    continue;
                }
                let mass = N::from_f64(k / kernel_sum);
                let pixel = frame.get_pixel(x0 + col as u32, y0 + row as u32);
                let bins = BinTriple::from_pixel(pixel.0);
                for (plane, cells) in model.cells.iter_mut().enumerate() {
                    let bin = bins.bin(plane);
                    cells[bin] = cells[bin].accumulate(mass);
                }
            }
        }
        Ok(model)
    }

    /// Builds a histogram of the given kind. The sampled bins are returned
    /// only for the single-pixel kind, whose change they fully describe.
    pub fn build_as(
        kind: HistogramKind,
        frame: &RgbImage,
        region: &TrackedRegion,
    ) -> TrackingResult<(Self, Option<BinTriple>)> {
        match kind {
            HistogramKind::SinglePixel => {
                let (model, bins) = Self::build(frame, region)?;
                Ok((model, Some(bins)))
            }
            HistogramKind::Epanechnikov => Ok((Self::build_kernel(frame, region)?, None)),
        }
    }

    pub fn increment(&mut self, bins: BinTriple) {
        for (plane, row) in self.cells.iter_mut().enumerate() {
            let bin = bins.bin(plane);
            row[bin] = row[bin].accumulate(N::unit());
        }
    }

    pub fn get(&self, plane: usize, bin: usize) -> N {
        self.cells[plane][bin]
    }

    pub fn plane(&self, plane: usize) -> &[N; BIN_COUNT] {
        &self.cells[plane]
    }

    pub fn cells(&self) -> impl Iterator<Item = &N> {
        self.cells.iter().flatten()
    }

    /// The `self / candidate` ratio of every bin of `plane`, as floats.
    pub fn ratio_table(&self, candidate: &Self, plane: usize) -> TrackingResult<[f32; BIN_COUNT]> {
        let mut table = [0.0f32; BIN_COUNT];
        for (bin, slot) in table.iter_mut().enumerate() {
            let divisor = candidate.get(plane, bin);
            *slot = N::ratio(self.get(plane, bin), divisor).ok_or_else(|| {
                TrackingError::degenerate(format!(
                    "candidate bin {bin} of plane {plane} is {divisor:?} ({} backend)",
                    N::NAME
                ))
            })?;
        }
        Ok(table)
    }
}

/// Row-major `1 - r^2` weights over a `width` x `height` region, where `r` is
/// the distance from the centre pixel relative to the half extents.
fn epanechnikov_profile(width: usize, height: usize) -> Vec<f64> {
    let half_w = (width / 2).max(1) as f64;
    let half_h = (height / 2).max(1) as f64;
    let mut kernel = Vec::with_capacity(width * height);
    for row in 0..height {
        let ny = (row as f64 - (height / 2) as f64) / half_h;
        for col in 0..width {
            let nx = (col as f64 - (width / 2) as f64) / half_w;
            let r2 = nx * nx + ny * ny;
            kernel.push(if r2 < 1.0 { 1.0 - r2 } else { 0.0 });
        }
    }
    kernel
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::numeric::Q16;
    use image::Rgb;

    #[test]
    fn bin_shift_is_four_for_sixteen_bins() {
        assert_eq!(BIN_SHIFT, 4);
    }

    #[test]
    fn quantization_is_monotonic_and_banded() {
        for value in 0..=255u8 {
            assert_eq!(quantize(value), value / 16);
            if value > 0 {
                assert!(quantize(value) >= quantize(value - 1));
            }
        }
        assert_eq!(quantize(0x3F), quantize(0x30));
        assert_ne!(quantize(0x40), quantize(0x3F));
    }

    #[test]
    fn samples_above_channel_range_clamp_to_last_bin() {
        assert_eq!(quantize_sample(255), 15);
        assert_eq!(quantize_sample(4096), 15);
        assert_eq!(quantize_sample(17), 1);
    }

    #[test]
    fn build_samples_only_the_centre_pixel() {
        let mut frame = RgbImage::from_pixel(32, 32, Rgb([0, 0, 0]));
        frame.put_pixel(18, 12, Rgb([200, 100, 50]));
        let region = TrackedRegion::new(10, 4, 16, 16);

        let (model, bins) = HistogramModel::<f32>::build(&frame, &region).unwrap();

        assert_eq!(bins.bins(), [12, 6, 3]);
        assert_eq!(model.cells().count(), PLANES * BIN_COUNT);
        assert!(model.cells().all(|c| *c > 0.0));
        for plane in 0..PLANES {
            let bumped: Vec<usize> = (0..BIN_COUNT)
                .filter(|&bin| model.get(plane, bin) >= 1.0)
                .collect();
            assert_eq!(bumped, vec![bins.bin(plane)]);
        }
    }

    #[test]
    fn q16_build_increments_exactly_once() {
        let frame = RgbImage::from_pixel(20, 20, Rgb([255, 16, 15]));
        let region = TrackedRegion::new(2, 2, 16, 16);

        let (model, bins) = HistogramModel::<Q16>::build(&frame, &region).unwrap();

        assert_eq!(bins.bins(), [15, 1, 0]);
        for plane in 0..PLANES {
            for bin in 0..BIN_COUNT {
                let expected = if bin == bins.bin(plane) {
                    Q16::ONE.saturating_add(Q16::EPSILON)
                } else {
                    Q16::EPSILON
                };
                assert_eq!(model.get(plane, bin), expected);
            }
        }
    }

    #[test]
    fn build_rejects_centre_outside_frame() {
        let frame = RgbImage::new(8, 8);
        let region = TrackedRegion::new(4, 4, 16, 16);
        let err = HistogramModel::<f32>::build(&frame, &region).unwrap_err();
        assert!(matches!(err, TrackingError::RegionOutOfBounds { .. }));
    }

    #[test]
    fn build_rejects_region_at_the_coordinate_limit() {
        let frame = RgbImage::new(8, 8);
        let region = TrackedRegion::new(i32::MAX - 2, 0, 16, 16);
        let err = HistogramModel::<Q16>::build(&frame, &region).unwrap_err();
        assert!(matches!(err, TrackingError::RegionOutOfBounds { region: r, .. } if r == region));
    }

    #[test]
    fn histogram_kind_names() {
        assert_eq!(HistogramKind::default(), HistogramKind::SinglePixel);
        assert_eq!(HistogramKind::from_name(" Epanechnikov"), Some(HistogramKind::Epanechnikov));
        assert_eq!(HistogramKind::from_name("single"), Some(HistogramKind::SinglePixel));
        assert_eq!(HistogramKind::from_name("gaussian"), None);
        assert!(!HistogramKind::Epanechnikov.is_mirrored());
    }

    #[test]
    fn single_pixel_kind_matches_plain_build() {
        let frame = RgbImage::from_fn(32, 32, |x, y| Rgb([(x * 8) as u8, (y * 8) as u8, 77]));
        let region = TrackedRegion::new(3, 9, 16, 12);
        let (plain, bins) = HistogramModel::<Q16>::build(&frame, &region).unwrap();
        let (kinded, kinded_bins) =
            HistogramModel::<Q16>::build_as(HistogramKind::SinglePixel, &frame, &region).unwrap();
        assert_eq!(plain, kinded);
        assert_eq!(Some(bins), kinded_bins);
    }

    #[test]
    fn kernel_profile_peaks_at_the_centre_and_vanishes_at_corners() {
        let kernel = epanechnikov_profile(16, 16);
        assert_eq!(kernel[8 * 16 + 8], 1.0);
        assert_eq!(kernel[0], 0.0);
        assert_eq!(kernel[15 * 16 + 15], 0.0);
        // Edge midpoints sit exactly on the ellipse.
        assert_eq!(kernel[8 * 16], 0.0);
        assert!(kernel[8 * 16 + 4] > 0.0 && kernel[8 * 16 + 4] < kernel[8 * 16 + 8]);
    }

    #[test]
    fn kernel_build_spreads_one_unit_over_the_region() {
        let frame = RgbImage::from_pixel(24, 24, Rgb([200, 100, 50]));
        let region = TrackedRegion::new(4, 4, 16, 16);

        let (model, bins) =
            HistogramModel::<f32>::build_as(HistogramKind::Epanechnikov, &frame, &region).unwrap();

        assert_eq!(bins, None);
        for (plane, bin) in [(0, 12), (1, 6), (2, 3)] {
            assert!((model.get(plane, bin) - 1.0).abs() < 1e-5);
            let others: f32 = (0..BIN_COUNT)
                .filter(|&b| b != bin)
                .map(|b| model.get(plane, b))
                .sum();
            assert!(others < 1e-8);
        }
    }

    #[test]
    fn kernel_build_weights_centre_over_periphery() {
        // Left half one colour, right half another, and a single pixel of a
        // third colour at the centre and in a corner.
        let mut frame = RgbImage::from_fn(16, 16, |x, _| {
            if x < 8 { Rgb([0, 0, 0]) } else { Rgb([255, 255, 255]) }
        });
        frame.put_pixel(8, 8, Rgb([128, 128, 128]));
        frame.put_pixel(0, 0, Rgb([64, 64, 64]));
        let region = TrackedRegion::new(0, 0, 16, 16);

        let model = HistogramModel::<f32>::build_kernel(&frame, &region).unwrap();

        // The corner lies outside the ellipse and adds nothing.
        assert_eq!(model.get(0, 4), f32::seed());
        // The centre pixel carries the single largest contribution.
        let kernel = epanechnikov_profile(16, 16);
        let total: f64 = kernel.iter().sum();
        assert!((model.get(0, 8) as f64 - 1.0 / total).abs() < 1e-6);
        assert!(model.get(0, 0) + model.get(0, 15) + model.get(0, 8) > 0.999);
    }

    #[test]
    fn q16_kernel_build_keeps_mass_close_to_one_unit() {
        let frame = RgbImage::from_pixel(20, 20, Rgb([255, 16, 15]));
        let region = TrackedRegion::new(2, 2, 16, 16);

        let model = HistogramModel::<Q16>::build_kernel(&frame, &region).unwrap();

        // Each pixel rounds by at most half a raw unit.
        for (plane, bin) in [(0, 15), (1, 1), (2, 0)] {
            let error = (model.get(plane, bin).raw() - Q16::ONE.raw()).abs();
            assert!(error <= 128, "plane {plane}: off by {error}");
            assert_eq!(model.get(plane, (bin + 1) % BIN_COUNT), Q16::EPSILON);
        }
        assert!(model.cells().all(|c| c.is_positive()));
    }

    #[test]
    fn kernel_build_needs_the_whole_region_inside_the_frame() {
        let frame = RgbImage::new(16, 16);
        let region = TrackedRegion::new(4, 4, 16, 16);
        assert!(matches!(
            HistogramModel::<f32>::build_kernel(&frame, &region),
            Err(TrackingError::RegionOutOfBounds { .. })
        ));
        assert!(matches!(
            HistogramModel::<f32>::build_kernel(&frame, &TrackedRegion::new(0, 0, 0, 4)),
            Err(TrackingError::ArithmeticDegeneracy(_))
        ));
    }

    #[test]
    fn bin_triple_validates_indices() {
        assert!(BinTriple::new([0, 15, 7]).is_ok());
        assert!(matches!(
            BinTriple::new([0, 16, 7]),
            Err(TrackingError::BinOutOfRange(16))
        ));
    }

    #[test]
    fn ratio_table_of_identical_histograms_is_unity() {
        let bins = BinTriple::new([1, 2, 3]).unwrap();
        let model = HistogramModel::<Q16>::from_bins(bins);
        for plane in 0..PLANES {
            let table = model.ratio_table(&model, plane).unwrap();
            assert!(table.iter().all(|&r| r == 1.0));
        }
    }

    #[test]
    fn ratio_table_flags_zero_divisor() {
        let model = HistogramModel::<f32>::seeded();
        let mut candidate = HistogramModel::<f32>::seeded();
        candidate.cells[1][4] = 0.0;
        assert!(model.ratio_table(&candidate, 0).is_ok());
        let err = model.ratio_table(&candidate, 1).unwrap_err();
        assert!(matches!(err, TrackingError::ArithmeticDegeneracy(_)));
    }
}
