//! `ruby` and `team-dashboard` roles
//!
//! Team Dashboard is a rails app on unicorn, listening on two unix sockets
//! that nginx proxies to on port 8081.

use super::Vars;
use crate::steps::{
    Directory, Exec, GitCheckout, Guard, Line, Package, RemoteFile, Service, Symlink,
};
use crate::templates::{DASHBOARD_DATABASE, DASHBOARD_NGINX, DASHBOARD_UPSTART};
use anyhow::Result;
use declarative::{Plan, RoleParams};

pub const REPOSITORY: &str = "https://github.com/fdietz/team_dashboard.git";

const RUBY_PACKAGES: [&str; 10] = [
    "ruby1.9.1",
    "ruby1.9.1-dev",
    "rubygems1.9.1",
    "irb1.9.1",
    "ri1.9.1",
    "rdoc1.9.1",
    "build-essential",
    "libopenssl-ruby1.9.1",
    "libssl-dev",
    "zlib1g-dev",
];

const RUBY_ALTERNATIVE: &str = "update-alternatives --install /usr/bin/ruby ruby /usr/bin/ruby1.9.1 400 \
    --slave /usr/share/man/man1/ruby.1.gz ruby.1.gz /usr/share/man/man1/ruby1.9.1.1.gz \
    --slave /usr/bin/ri ri /usr/bin/ri1.9.1 \
    --slave /usr/bin/irb irb /usr/bin/irb1.9.1 \
    --slave /usr/bin/rdoc rdoc /usr/bin/rdoc1.9.1";

const GEM_ALTERNATIVE: &str = "update-alternatives --install /usr/bin/gem gem /usr/bin/gem1.9.1 400";

const LIBRARIES: [&str; 5] = [
    "postgresql-client",
    "libpq-dev",
    "libxml2-dev",
    "libmysqlclient-dev",
    "libxslt-dev",
];

/// unicorn listens here instead of a TCP port
const SOCKETS: [&str; 2] = [
    r#"listen "/tmp/.unicorn.sock.0", :backlog => 64"#,
    r#"listen "/tmp/.unicorn.sock.1", :backlog => 64"#,
];

const NGINX_SITE: &str = "/etc/nginx/sites-available/teamdashboard";
const UNICORN_JOB: &str = "/etc/init/teamdashboard.conf";
const LOG_DIR: &str = "/var/log/teamdashboard";

pub fn ruby(_params: &RoleParams) -> Result<Plan> {
    let mut plan = Plan::new("ruby");
    plan.add(Exec::new(
        "exec:apt-update",
        "apt-get update",
        Guard::once("apt-update"),
    ))
    .add(
        Package::apt(RUBY_PACKAGES)
            .named("package:ruby")
            .after(["exec:apt-update"]),
    )
    .add(
        Exec::new(
            "exec:ruby-alternative",
            RUBY_ALTERNATIVE,
            Guard::creates("/etc/alternatives/ruby"),
        )
        .undo_with("update-alternatives --remove ruby /usr/bin/ruby1.9.1")
        .after(["package:ruby"]),
    )
    .add(
        Exec::new(
            "exec:gem-alternative",
            GEM_ALTERNATIVE,
            Guard::creates("/etc/alternatives/gem"),
        )
        .undo_with("update-alternatives --remove gem /usr/bin/gem1.9.1")
        .after(["package:ruby"]),
    );
    Ok(plan)
}

/// A rake task run from the app root in production
fn rake(vars: &Vars, task: &str, guard: Guard) -> Exec {
    Exec::new(
        format!("exec:rake-{}", task.replace(':', "-")),
        format!("bundle exec rake {}", task),
        guard,
    )
    .in_dir(vars.get("app_root"))
    .env("RAILS_ENV", "production")
}

pub fn team_dashboard(params: &RoleParams) -> Result<Plan> {
    let vars = Vars::new(params);
    let app = vars.get("app_root");
    let git_id = format!("git:{}", app);
    let gemfile = format!("{}/Gemfile", app);
    let database = format!("{}/config/database.yml", app);
    let unicorn = format!("{}/config/unicorn.rb", app);

    let mut plan = Plan::new("team-dashboard");
    plan.add(Package::apt(LIBRARIES).named("package:team-dashboard-libs"))
        .add(GitCheckout::new(REPOSITORY, app))
        .add(Package::gem(["bundler"]))
        .add(
            Line::new(gemfile.as_str(), r#"gem "pg""#)
                .named("line:gemfile-pg")
                .after([git_id.as_str()]),
        )
        .add(
            Exec::new("exec:bundle-install", "bundle install", Guard::unless("bundle check"))
                .in_dir(app)
                .after(["line:gemfile-pg", "package:bundler", "package:team-dashboard-libs"]),
        )
        .add(
            RemoteFile::new(database.as_str(), vars.render(&DASHBOARD_DATABASE)?)
                .after([git_id.as_str()]),
        )
        .add(
            Line::new(unicorn.as_str(), SOCKETS[0])
                .replacing(r#"^listen [^"].*$"#)
                .named("line:unicorn-socket-0")
                .after([git_id.as_str()]),
        )
        .add(
            Line::new(unicorn.as_str(), SOCKETS[1])
                .named("line:unicorn-socket-1")
                .after(["line:unicorn-socket-0"]),
        );

    plan.add(
        rake(&vars, "db:create", Guard::once("team-dashboard-db-create")).after([
            "exec:bundle-install".to_string(),
            format!("file:{}", database),
        ]),
    )
    .add(
        rake(
            &vars,
            "db:migrate",
            Guard::unless("bundle exec rake db:abort_if_pending_migrations"),
        )
        .after(["exec:rake-db-create"]),
    )
    .add(
        rake(
            &vars,
            "assets:precompile",
            Guard::creates("public/assets/manifest.yml"),
        )
        .after(["exec:rake-db-migrate"]),
    );

    plan.add(RemoteFile::new(NGINX_SITE, vars.render(&DASHBOARD_NGINX)?))
        .add(
            Symlink::new("/etc/nginx/sites-enabled/teamdashboard", NGINX_SITE)
                .after([format!("file:{}", NGINX_SITE)]),
        )
        .add(RemoteFile::new(UNICORN_JOB, vars.render(&DASHBOARD_UPSTART)?))
        .add(
            Directory::new(LOG_DIR)
                .owner("www-data:www-data")
                .recursive(),
        )
        .add(
            Service::new("teamdashboard")
                .watching(UNICORN_JOB)
                .watching(database.as_str())
                .watching(unicorn.as_str())
                .after([
                    format!("file:{}", UNICORN_JOB),
                    format!("directory:{}", LOG_DIR),
                    "exec:rake-assets-precompile".to_string(),
                    "line:unicorn-socket-1".to_string(),
                ]),
        )
        .add(
            Service::new("nginx")
                .named("service:nginx-teamdashboard")
                .watching(NGINX_SITE)
                .after([
                    "symlink:/etc/nginx/sites-enabled/teamdashboard",
                    "service:teamdashboard",
                ]),
        );
    Ok(plan)
}
