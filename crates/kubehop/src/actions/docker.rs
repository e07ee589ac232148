//! Container engine actions.

use anyhow::Result;

use super::password;
use crate::params::{validate_container, validate_image, Params};
use crate::registry::{CommandRegistry, CommandTemplate};
use crate::shell::{quote, sudo, tolerant};

pub const INSTALL_DOCKER: &str = "installDocker";
pub const UNINSTALL_DOCKER: &str = "uninstallDocker";
pub const DOCKER_STATUS: &str = "dockerStatus";
pub const DOCKER_INFO: &str = "dockerInfo";
pub const LIST_CONTAINERS: &str = "listContainers";
pub const START_CONTAINER: &str = "startContainer";
pub const STOP_CONTAINER: &str = "stopContainer";
pub const RESTART_CONTAINER: &str = "restartContainer";
pub const REMOVE_CONTAINER: &str = "removeContainer";
pub const LIST_IMAGES: &str = "listImages";
pub const PULL_IMAGE: &str = "pullImage";

const DOCKER_PACKAGES: &str = "docker-ce docker-ce-cli containerd.io docker-buildx-plugin docker-compose-plugin";

/// Register the container engine actions.
pub fn register(registry: &mut CommandRegistry) {
    registry.register(
        INSTALL_DOCKER,
        CommandTemplate::built(|p| {
            Ok(vec![
                sudo(password(p), "curl -fsSL https://get.docker.com -o /tmp/get-docker.sh && sh /tmp/get-docker.sh"),
                sudo(password(p), "systemctl enable --now docker"),
                sudo(password(p), "docker version --format '{{.Server.Version}}'"),
            ])
        }),
    );

    registry.register(
        UNINSTALL_DOCKER,
        CommandTemplate::built(|p| {
            Ok([
                "systemctl disable --now docker docker.socket".to_string(),
                format!(
                    "if command -v apt-get >/dev/null 2>&1; then DEBIAN_FRONTEND=noninteractive apt-get purge -y {DOCKER_PACKAGES}; \
                     else yum remove -y {DOCKER_PACKAGES}; fi"
                ),
                "rm -rf /var/lib/docker /var/lib/containerd".to_string(),
            ]
            .iter()
            .map(|cmd| sudo(password(p), &tolerant(cmd)))
            .collect())
        }),
    );

    registry.register(DOCKER_STATUS, CommandTemplate::fixed(["systemctl is-active docker"]));

    registry.register(
        DOCKER_INFO,
        CommandTemplate::built(|p| Ok(vec![sudo(password(p), "docker info --format '{{json .}}'")])),
    );

    registry.register(
        LIST_CONTAINERS,
        CommandTemplate::built(|p| {
            let all = if p.flag("running_only") { "" } else { " -a" };
            Ok(vec![sudo(
                password(p),
                &format!("docker ps{all} --format '{{{{json .}}}}'"),
            )])
        }),
    );

    for (action, verb) in [
        (START_CONTAINER, "start"),
        (STOP_CONTAINER, "stop"),
        (RESTART_CONTAINER, "restart"),
    ] {
        registry.register(
            action,
            CommandTemplate::built(move |p| {
                Ok(vec![sudo(password(p), &format!("docker {verb} {}", quote(container(p)?)))])
            })
            .validated(|p| container(p).map(|_| ())),
        );
    }

    registry.register(
        REMOVE_CONTAINER,
        CommandTemplate::built(|p| {
            let force = if p.flag("force") { " -f" } else { "" };
            Ok(vec![sudo(password(p), &format!("docker rm{force} {}", quote(container(p)?)))])
        })
        .validated(|p| container(p).map(|_| ())),
    );

    registry.register(
        LIST_IMAGES,
        CommandTemplate::built(|p| Ok(vec![sudo(password(p), "docker images --format '{{json .}}'")])),
    );

    registry.register(
        PULL_IMAGE,
        CommandTemplate::built(|p| Ok(vec![sudo(password(p), &format!("docker pull {}", quote(image(p)?)))]))
            .validated(|p| image(p).map(|_| ())),
    );
}

fn container(p: &Params) -> Result<&str> {
    let id = p.require_str("container")?;
    validate_container(id)?;
    Ok(id)
}

fn image(p: &Params) -> Result<&str> {
    let image = p.require_str("image")?;
    validate_image(image)?;
    Ok(image)
}
