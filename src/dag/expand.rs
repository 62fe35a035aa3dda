//! Wildcard expansion: templates plus samples in, concrete task instances out.

use std::path::PathBuf;

use fxhash::FxHashMap as HashMap;

use crate::config::defs::SAMPLE_WILDCARD;
use crate::config::manifest::Sample;
use crate::dag::error::TemplateError;
use crate::dag::template::{InputPattern, Parameterization, TaskInstance, TaskTemplate};
use crate::utils::file::clean_path;

/// Expands one template against the ordered sample list.
///
/// # Arguments
///
/// * `template` - Template to expand.
/// * `samples` - Samples in the order instances should be declared.
///
/// # Returns
/// One instance per sample for per-sample templates, exactly one otherwise.
pub fn expand(template: &TaskTemplate, samples: &[Sample]) -> Result<Vec<TaskInstance>, TemplateError> {
    validate_patterns(template)?;

    let instances = match template.parameterization {
        Parameterization::Unparameterized => vec![instantiate(template, None, samples)?],
        Parameterization::PerSample => samples
            .iter()
            .map(|sample| instantiate(template, Some(sample), samples))
            .collect::<Result<Vec<_>, _>>()?,
    };

    check_unique_outputs(&instances)?;
    Ok(instances)
}

/// Expands every template in declaration order and numbers the instances.
/// No two instances may claim the same output path.
pub fn expand_all(templates: &[TaskTemplate], samples: &[Sample]) -> Result<Vec<TaskInstance>, TemplateError> {
    let mut instances = Vec::new();
    for template in templates {
        instances.extend(expand(template, samples)?);
    }
    for (declared, instance) in instances.iter_mut().enumerate() {
        instance.declared = declared;
    }
    check_unique_outputs(&instances)?;
    Ok(instances)
}

fn validate_patterns(template: &TaskTemplate) -> Result<(), TemplateError> {
    for input in &template.inputs {
        match (input, template.parameterization) {
            (InputPattern::EachSample(_), Parameterization::PerSample) => {
                return Err(TemplateError::InvalidPattern {
                    template: template.name.clone(),
                    reason: "per-sample templates cannot take an every-sample input".to_string(),
                });
            }
            (InputPattern::SampleReads, Parameterization::Unparameterized) => {
                return Err(TemplateError::InvalidPattern {
                    template: template.name.clone(),
                    reason: "sample reads need a per-sample template".to_string(),
                });
            }
            _ => {}
        }
    }
    if !template.each_sample_args.is_empty() && template.parameterization == Parameterization::PerSample {
        return Err(TemplateError::InvalidPattern {
            template: template.name.clone(),
            reason: "per-sample templates cannot take every-sample arguments".to_string(),
        });
    }
    Ok(())
}

fn instantiate(
    template: &TaskTemplate,
    sample: Option<&Sample>,
    samples: &[Sample],
) -> Result<TaskInstance, TemplateError> {
    let binding = sample.map(|s| s.id.as_str());

    let mut inputs = Vec::new();
    for input in &template.inputs {
        match input {
            InputPattern::Path(pattern) => {
                inputs.push(clean_path(&substitute(&template.name, pattern, binding)?));
            }
            InputPattern::EachSample(pattern) => {
                for each in samples {
                    inputs.push(clean_path(&substitute(&template.name, pattern, Some(&each.id))?));
                }
            }
            InputPattern::SampleReads => {
                if let Some(sample) = sample {
                    inputs.extend(sample.interleaved_reads().iter().map(|p| clean_path(p)));
                }
            }
        }
    }

    let outputs = template
        .outputs
        .iter()
        .map(|pattern| substitute(&template.name, pattern, binding).map(|p| clean_path(&p)))
        .collect::<Result<Vec<PathBuf>, _>>()?;

    let mut args = template
        .args
        .iter()
        .map(|pattern| substitute(&template.name, pattern, binding))
        .collect::<Result<Vec<String>, _>>()?;
    for each in samples {
        for pattern in &template.each_sample_args {
            args.push(substitute(&template.name, pattern, Some(&each.id))?);
        }
    }

    Ok(TaskInstance {
        id: TaskInstance::instance_id(&template.name, binding),
        template: template.name.clone(),
        sample: binding.map(str::to_string),
        inputs,
        outputs,
        args,
        resources: template.resources,
        declared: 0,
    })
}

/// Replaces `{sample}` tokens. Any other `{name}` is rejected, as is
/// `{sample}` when the template has no sample bound.
fn substitute(template: &str, pattern: &str, sample: Option<&str>) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(pattern.len());
    let mut rest = pattern;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after.find('}').ok_or_else(|| TemplateError::Syntax {
            template: template.to_string(),
            pattern: pattern.to_string(),
        })?;
        let name = &after[..close];

        if name != SAMPLE_WILDCARD {
            return Err(TemplateError::UnknownPlaceholder {
                template: template.to_string(),
                placeholder: name.to_string(),
                pattern: pattern.to_string(),
            });
        }
        match sample {
            Some(sample) => out.push_str(sample),
            None => {
                return Err(TemplateError::UnboundPlaceholder {
                    template: template.to_string(),
                    placeholder: name.to_string(),
                    pattern: pattern.to_string(),
                });
            }
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn check_unique_outputs(instances: &[TaskInstance]) -> Result<(), TemplateError> {
    let mut claimed: HashMap<&PathBuf, &str> = HashMap::default();
    for instance in instances {
        for output in &instance.outputs {
            if let Some(first) = claimed.insert(output, &instance.id) {
                return Err(TemplateError::DuplicateOutput {
                    path: output.clone(),
                    first: first.to_string(),
                    second: instance.id.clone(),
                });
            }
        }
    }
    Ok(())
}
