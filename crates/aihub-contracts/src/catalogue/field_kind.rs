/// Every field kind the client knows how to build.
///
/// Wire tags map onto these variants through [`FieldKind::from_tag`]; a tag
/// without a variant is rejected when the catalogue is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Integer,
    Steps,
    Float,
    Cfg,
    Boolean,
    Text,
    StringSelection,
    Sampler,
    Scheduler,
    ExtendableScheduler,
    Seed,
    Model,
    ModelSimple,
    Image,
    ImageInfoOnly,
    ImageBatch,
    Frame,
    File,
    ProjectFile,
    ProjectFilesBatch,
    ConfigString,
    ConfigInteger,
    ConfigBoolean,
    ConfigFloat,
}

const TAGS: &[(&str, FieldKind)] = &[
    ("AIHubExposeInteger", FieldKind::Integer),
    ("AIHubExposeSteps", FieldKind::Steps),
    ("AIHubExposeFloat", FieldKind::Float),
    ("AIHubExposeCfg", FieldKind::Cfg),
    ("AIHubExposeBoolean", FieldKind::Boolean),
    ("AIHubExposeString", FieldKind::Text),
    ("AIHubExposeStringSelection", FieldKind::StringSelection),
    ("AIHubExposeSampler", FieldKind::Sampler),
    ("AIHubExposeScheduler", FieldKind::Scheduler),
    ("AIHubExposeExtendableScheduler", FieldKind::ExtendableScheduler),
    ("AIHubExposeSeed", FieldKind::Seed),
    ("AIHubExposeModel", FieldKind::Model),
    ("AIHubExposeModelSimple", FieldKind::ModelSimple),
    ("AIHubExposeImage", FieldKind::Image),
    ("AIHubExposeImageInfoOnly", FieldKind::ImageInfoOnly),
    ("AIHubExposeImageBatch", FieldKind::ImageBatch),
    ("AIHubExposeFrame", FieldKind::Frame),
    ("AIHubExposeFile", FieldKind::File),
    ("AIHubExposeProjectFile", FieldKind::ProjectFile),
    ("AIHubExposeProjectFilesBatch", FieldKind::ProjectFilesBatch),
    ("AIHubExposeConfigString", FieldKind::ConfigString),
    ("AIHubExposeConfigInteger", FieldKind::ConfigInteger),
    ("AIHubExposeConfigBoolean", FieldKind::ConfigBoolean),
    ("AIHubExposeConfigFloat", FieldKind::ConfigFloat),
];

impl FieldKind {
    pub fn from_tag(tag: &str) -> Option<Self> {
        TAGS.iter()
            .find(|(candidate, _)| *candidate == tag)
            .map(|(_, kind)| *kind)
    }

    pub fn tag(self) -> &'static str {
        TAGS.iter()
            .find(|(_, kind)| *kind == self)
            .map(|(tag, _)| *tag)
            .unwrap_or("AIHubExposeUnknown")
    }

    pub fn is_model(self) -> bool {
        matches!(self, FieldKind::Model | FieldKind::ModelSimple)
    }

    /// Kinds whose value reacts to `default_sampler`/`default_scheduler`.
    pub fn follows_model_choice(self) -> bool {
        matches!(
            self,
            FieldKind::Sampler | FieldKind::Scheduler | FieldKind::ExtendableScheduler
        )
    }

    pub fn is_config(self) -> bool {
        matches!(
            self,
            FieldKind::ConfigString
                | FieldKind::ConfigInteger
                | FieldKind::ConfigBoolean
                | FieldKind::ConfigFloat
        )
    }

    pub fn is_image_like(self) -> bool {
        matches!(
            self,
            FieldKind::Image | FieldKind::ImageInfoOnly | FieldKind::Frame
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{FieldKind, TAGS};

    #[test]
    fn tags_map_both_ways() {
        for (tag, kind) in TAGS {
            assert_eq!(FieldKind::from_tag(tag), Some(*kind));
            assert_eq!(kind.tag(), *tag);
        }
    }

    #[test]
    fn unknown_tags_are_rejected() {
        assert_eq!(FieldKind::from_tag("AIHubExposeHologram"), None);
        assert_eq!(FieldKind::from_tag("aihubexposeinteger"), None);
    }
}
