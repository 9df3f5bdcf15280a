use super::WorkflowCatalogue;

/// What the option lists need to know about the open project.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProjectView<'a> {
    pub project_type: Option<&'a str>,
    pub current_timeline_initial: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowOption {
    pub id: String,
    pub label: String,
    pub special: bool,
    pub project_init: bool,
}

impl WorkflowOption {
    /// `<label>` for project-init workflows, `[label]` for same-type ones.
    pub fn display_label(&self) -> String {
        if self.project_init {
            format!("<{}>", self.label)
        } else if self.special {
            format!("[{}]", self.label)
        } else {
            self.label.clone()
        }
    }
}

/// Workflows of one (context, category), filtered and ordered for the open
/// project: init first, then special, then the rest by label.
pub fn workflow_options(
    catalogue: &WorkflowCatalogue,
    context: &str,
    category: &str,
    project: Option<ProjectView<'_>>,
) -> Vec<WorkflowOption> {
    let mut options = Vec::new();
    for workflow in catalogue.workflows.values() {
        if workflow.context != context || workflow.category != category {
            continue;
        }
        let workflow_type = workflow.project_type.as_deref();
        let mut special = false;
        let mut project_init = false;

        match project.and_then(|view| view.project_type.map(|kind| (kind, view))) {
            Some((current_type, view)) => {
                if workflow_type.is_some_and(|kind| kind != current_type) {
                    continue;
                }
                if workflow.project_type_init && !view.current_timeline_initial {
                    continue;
                }
                special = workflow_type == Some(current_type);
                project_init = workflow.project_type_init;
            }
            None => {
                if workflow_type.is_some() {
                    if !workflow.project_type_init {
                        continue;
                    }
                    project_init = true;
                }
            }
        }

        options.push(WorkflowOption {
            id: workflow.id.clone(),
            label: workflow.label.clone(),
            special,
            project_init,
        });
    }

    options.sort_by_key(|option| (!option.project_init, !option.special, option.label.to_lowercase()));
    options
}

/// Remembered value when still offered, otherwise the first entry.
pub fn pick_default<'a>(available: &'a [String], remembered: Option<&str>) -> Option<&'a str> {
    remembered
        .and_then(|wanted| available.iter().find(|item| item.as_str() == wanted))
        .or_else(|| available.first())
        .map(String::as_str)
}

/// Remembered context, else `image`, else the first one.
pub fn pick_context<'a>(contexts: &'a [String], remembered: Option<&str>) -> Option<&'a str> {
    remembered
        .and_then(|wanted| contexts.iter().find(|item| item.as_str() == wanted))
        .or_else(|| contexts.iter().find(|item| item.as_str() == "image"))
        .or_else(|| contexts.first())
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::protocol::InfoList;

    fn catalogue() -> anyhow::Result<WorkflowCatalogue> {
        let info: InfoList = serde_json::from_value(json!({
            "workflows": {
                "plain": {"label": "zeta plain", "context": "image", "category": "gen"},
                "comic_init": {"label": "New comic", "context": "image", "category": "gen", "project_type": "comic", "project_type_init": true},
                "comic_panel": {"label": "Add panel", "context": "image", "category": "gen", "project_type": "comic"},
                "story_step": {"label": "Story step", "context": "image", "category": "gen", "project_type": "story"},
                "alpha": {"label": "Alpha plain", "context": "image", "category": "gen"}
            }
        }))?;
        Ok(WorkflowCatalogue::from_info_list(info)?)
    }

    fn ids(options: &[WorkflowOption]) -> Vec<&str> {
        options.iter().map(|option| option.id.as_str()).collect()
    }

    #[test]
    fn outside_project_only_init_typed_workflows_show() -> anyhow::Result<()> {
        let catalogue = catalogue()?;
        let options = workflow_options(&catalogue, "image", "gen", None);
        assert_eq!(ids(&options), vec!["comic_init", "alpha", "plain"]);
        assert_eq!(options[0].display_label(), "<New comic>");
        assert_eq!(options[1].display_label(), "Alpha plain");
        Ok(())
    }

    #[test]
    fn inside_initial_timeline_of_matching_project() -> anyhow::Result<()> {
        let catalogue = catalogue()?;
        let view = ProjectView {
            project_type: Some("comic"),
            current_timeline_initial: true,
        };
        let options = workflow_options(&catalogue, "image", "gen", Some(view));
        assert_eq!(ids(&options), vec!["comic_init", "comic_panel", "alpha", "plain"]);
        assert_eq!(options[1].display_label(), "[Add panel]");
        Ok(())
    }

    #[test]
    fn non_initial_timeline_hides_init_workflows() -> anyhow::Result<()> {
        let catalogue = catalogue()?;
        let view = ProjectView {
            project_type: Some("comic"),
            current_timeline_initial: false,
        };
        let options = workflow_options(&catalogue, "image", "gen", Some(view));
        assert_eq!(ids(&options), vec!["comic_panel", "alpha", "plain"]);
        Ok(())
    }

    #[test]
    fn defaults_fall_back_in_order() {
        let contexts = vec!["video".to_string(), "image".to_string()];
        assert_eq!(pick_context(&contexts, Some("video")), Some("video"));
        assert_eq!(pick_context(&contexts, Some("audio")), Some("image"));
        assert_eq!(pick_context(&contexts[..1], None), Some("video"));
        assert_eq!(pick_default(&contexts, Some("gone")), Some("video"));
        assert_eq!(pick_default(&[], None), None);
    }
}
