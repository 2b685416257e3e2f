//! Sample validation against a generator's subject/aspect cross-product.

use std::collections::HashSet;

use crate::error::CollectorError;
use crate::models::{Generator, Sample};

/// Separator between the subject path and aspect name in a sample name.
pub const SAMPLE_NAME_SEPARATOR: char = '|';

/// Check that `samples` fit the resolved subjects and aspects of `generator`.
///
/// Matching is case-insensitive. The batch may not exceed the
/// `subjects x aspects` cross-product, every name must be `subject|aspect`
/// with a known subject and aspect, and no name may repeat.
pub fn validate_samples(samples: &[Sample], generator: &Generator) -> Result<(), CollectorError> {
    let subjects: HashSet<String> = generator
        .resolved_subjects()
        .iter()
        .map(|subject| subject.absolute_path.to_lowercase())
        .collect();
    let aspects: HashSet<String> = generator
        .aspects
        .iter()
        .map(|aspect| aspect.name.to_lowercase())
        .collect();

    let subject_count = generator.resolved_subjects().len();
    let aspect_count = generator.aspects.len();
    if samples.len() > subject_count * aspect_count {
        return Err(CollectorError::validation(format!(
            "Number of samples more than expected. Samples count: {}, Subject count: {}, Aspect count: {}",
            samples.len(),
            subject_count,
            aspect_count
        )));
    }

    let mut seen = HashSet::with_capacity(samples.len());
    for sample in samples {
        let parts: Vec<&str> = sample.name.split(SAMPLE_NAME_SEPARATOR).collect();
        let [subject, aspect] = parts.as_slice() else {
            return Err(CollectorError::validation(format!(
                "Invalid sample name: {}",
                sample.name
            )));
        };

        if !subjects.contains(&subject.to_lowercase()) || !aspects.contains(&aspect.to_lowercase()) {
            return Err(CollectorError::validation(format!(
                "Unknown subject or aspect for sample: {}",
                sample.name
            )));
        }

        if !seen.insert(sample.name.to_lowercase()) {
            return Err(CollectorError::validation(format!(
                "Duplicate sample found: {}",
                sample.name
            )));
        }
    }

    Ok(())
}
