//! Landmark borders.
//!
//! A border is an ordered polyline of points ("links") drawn on a surface,
//! with a name used to pair source and target borders and a variance that
//! expresses how precisely the landmark was placed.

use nalgebra::Point3;
use serde::{Deserialize, Serialize};

/// One named landmark polyline.
#[derive(Debug, Clone, PartialEq)]
pub struct Border {
    pub name: String,
    pub variance: f64,
    pub links: Vec<Point3<f64>>,
}

impl Border {
    /// Create a border with variance 1.
    pub fn new(name: impl Into<String>, links: Vec<Point3<f64>>) -> Self {
        Self {
            name: name.into(),
            variance: 1.0,
            links,
        }
    }

    /// Set the variance.
    pub fn with_variance(mut self, variance: f64) -> Self {
        self.variance = variance;
        self
    }

    /// Number of links.
    #[inline]
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Total length of the polyline.
    pub fn length(&self) -> f64 {
        self.links.windows(2).map(|w| (w[1] - w[0]).norm()).sum()
    }

    /// Resample to `count` links evenly spaced along the polyline.
    ///
    /// The first and last links are kept. Borders with fewer than two links
    /// or a `count` below two are left alone.
    pub fn resample_to_link_count(&mut self, count: usize) {
        if self.links.len() < 2 || count < 2 {
            return;
        }
        let total = self.length();
        if total <= 0.0 {
            return;
        }

        let mut cumulative = Vec::with_capacity(self.links.len());
        let mut acc = 0.0;
        cumulative.push(0.0);
        for w in self.links.windows(2) {
            acc += (w[1] - w[0]).norm();
            cumulative.push(acc);
        }

        let step = total / (count - 1) as f64;
        let mut resampled = Vec::with_capacity(count);
        let mut segment = 0;
        for i in 0..count {
            let target = (i as f64 * step).min(total);
            while segment + 2 < cumulative.len() && cumulative[segment + 1] < target {
                segment += 1;
            }
            let (a, b) = (self.links[segment], self.links[segment + 1]);
            let len = cumulative[segment + 1] - cumulative[segment];
            let t = if len > 0.0 {
                ((target - cumulative[segment]) / len).clamp(0.0, 1.0)
            } else {
                0.0
            };
            resampled.push(a + (b - a) * t);
        }
        self.links = resampled;
    }

    /// Resample so consecutive links are about `spacing` apart.
    ///
    /// Returns the new link count (at least two).
    pub fn resample_to_spacing(&mut self, spacing: f64) -> usize {
        if self.links.len() < 2 || spacing <= 0.0 {
            return self.links.len();
        }
        let count = ((self.length() / spacing).round() as usize + 1).max(2);
        self.resample_to_link_count(count);
        self.links.len()
    }
}

/// Ordered collection of borders.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BorderSet {
    borders: Vec<Border>,
}

impl BorderSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a border.
    pub fn push(&mut self, border: Border) {
        self.borders.push(border);
    }

    /// Number of borders.
    #[inline]
    pub fn len(&self) -> usize {
        self.borders.len()
    }

    /// True if there are no borders.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.borders.is_empty()
    }

    /// Border by index.
    #[inline]
    pub fn get(&self, index: usize) -> Option<&Border> {
        self.borders.get(index)
    }

    /// First border with the given name.
    pub fn find_by_name(&self, name: &str) -> Option<&Border> {
        self.borders.iter().find(|b| b.name == name)
    }

    /// Mutable access to the first border with the given name.
    pub fn find_by_name_mut(&mut self, name: &str) -> Option<&mut Border> {
        self.borders.iter_mut().find(|b| b.name == name)
    }

    /// Iterate over the borders.
    pub fn iter(&self) -> std::slice::Iter<'_, Border> {
        self.borders.iter()
    }

    /// Mutable iteration.
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Border> {
        self.borders.iter_mut()
    }

    /// Number of links across every border.
    pub fn total_links(&self) -> usize {
        self.borders.iter().map(Border::link_count).sum()
    }

    /// Push every link onto the sphere of the given radius.
    pub fn project_to_sphere(&mut self, radius: f64) {
        for border in &mut self.borders {
            for link in &mut border.links {
                let len = link.coords.norm();
                if len > 0.0 {
                    link.coords *= radius / len;
                }
            }
        }
    }
}

impl FromIterator<Border> for BorderSet {
    fn from_iter<I: IntoIterator<Item = Border>>(iter: I) -> Self {
        Self {
            borders: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a BorderSet {
    type Item = &'a Border;
    type IntoIter = std::slice::Iter<'a, Border>;

    fn into_iter(self) -> Self::IntoIter {
        self.borders.iter()
    }
}

/// How borders are resampled at the start of every stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "mode", content = "spacing")]
pub enum BorderResampling {
    /// Use the links as drawn.
    #[default]
    None,
    /// Resample source borders to this link spacing and the matching target
    /// borders to the same link count.
    Spacing(f64),
}

/// Resample paired borders so each source/target pair has the same link count.
///
/// Source borders without a target partner are left alone; pairing is
/// checked later when the borders are tessellated.
pub fn resample_border_pairs(source: &mut BorderSet, target: &mut BorderSet, mode: BorderResampling) {
    let BorderResampling::Spacing(spacing) = mode else {
        return;
    };
    for border in source.iter_mut() {
        if border.link_count() < 2 {
            continue;
        }
        let count = border.resample_to_spacing(spacing);
        if let Some(partner) = target.find_by_name_mut(&border.name) {
            partner.resample_to_link_count(count);
        }
    }
}
