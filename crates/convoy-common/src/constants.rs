//! Well-known file names, environment variables, and label keys.

/// Compose files looked up (in this order) when none is given explicitly.
pub const DEFAULT_COMPOSE_FILES: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "compose.override.yaml",
    "compose.override.yml",
    "podman-compose.yaml",
    "podman-compose.yml",
    "docker-compose.yml",
    "docker-compose.yaml",
    "docker-compose.override.yml",
    "docker-compose.override.yaml",
    "container-compose.yml",
    "container-compose.yaml",
    "container-compose.override.yml",
    "container-compose.override.yaml",
];

/// Default dotenv file, relative to the project directory.
pub const DEFAULT_ENV_FILE: &str = ".env";

/// Marker used in place of a path to read a document from stdin.
pub const STDIN_MARKER: &str = "-";

/// Overrides the project name.
pub const ENV_PROJECT_NAME: &str = "COMPOSE_PROJECT_NAME";
/// Overrides the project directory.
pub const ENV_PROJECT_DIR: &str = "COMPOSE_PROJECT_DIR";
/// List of compose files, separated by [`ENV_PATH_SEPARATOR`].
pub const ENV_COMPOSE_FILE: &str = "COMPOSE_FILE";
/// Separator used in [`ENV_COMPOSE_FILE`].
pub const ENV_PATH_SEPARATOR: &str = "COMPOSE_PATH_SEPARATOR";
/// Comma-separated list of active profiles.
pub const ENV_PROFILES: &str = "COMPOSE_PROFILES";

/// Path separator used when [`ENV_PATH_SEPARATOR`] is unset.
pub const DEFAULT_PATH_SEPARATOR: &str = ":";

/// Separator between project, service, and replica number in names.
pub const NAME_SEPARATOR: &str = "_";

/// Registry prefix for images built locally from a service.
pub const LOCAL_IMAGE_PREFIX: &str = "localhost/";

/// URL scheme used to reference an image as a build context.
pub const IMAGE_CONTEXT_SCHEME: &str = "docker://";

/// Label carrying the merged-document hash.
pub const LABEL_CONFIG_HASH: &str = "io.podman.compose.config-hash";
/// Label carrying the project name.
pub const LABEL_PROJECT: &str = "io.podman.compose.project";
/// Label carrying the tool version.
pub const LABEL_VERSION: &str = "io.podman.compose.version";
/// Docker-compatible project label.
pub const LABEL_COMPOSE_PROJECT: &str = "com.docker.compose.project";
/// Docker-compatible working directory label.
pub const LABEL_WORKING_DIR: &str = "com.docker.compose.project.working_dir";
/// Docker-compatible config files label.
pub const LABEL_CONFIG_FILES: &str = "com.docker.compose.project.config_files";
/// Docker-compatible replica number label.
pub const LABEL_CONTAINER_NUMBER: &str = "com.docker.compose.container-number";
/// Docker-compatible service label.
pub const LABEL_SERVICE: &str = "com.docker.compose.service";

/// Application name used in CLI output.
pub const APP_NAME: &str = "convoy";

/// Version string stamped into container labels.
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
