//! `base` and `graphite` roles
//!
//! Graphite runs the megacarbon branch of carbon with the ceres storage
//! backend. graphite-web is served by uwsgi behind nginx on port 8080.

use super::{SETTING_TIMEZONE, Vars};
use crate::session::quote;
use crate::steps::{
    Directory, Exec, GitCheckout, Guard, Line, Package, RemoteFile, Service, Symlink, User,
};
use crate::templates::{
    CARBON_WRITER_MONIT, CARBON_WRITER_UPSTART, GRAPHITE_NGINX, GRAPHITE_UWSGI,
};
use anyhow::Result;
use declarative::{Plan, RoleParams};

pub const CERES: &str = "git://github.com/graphite-project/ceres.git";
pub const CARBON: &str = "git://github.com/graphite-project/carbon.git";
pub const GRAPHITE_WEB: &str = "git://github.com/graphite-project/graphite-web.git";

const BASE_PACKAGES: [&str; 13] = [
    "aptitude",
    "upstart",
    "monit",
    "git",
    "python-pip",
    "python-dev",
    "libcairo2",
    "libffi-dev",
    "memcached",
    "nginx",
    "uwsgi",
    "uwsgi-plugin-python",
    "uwsgi-plugin-carbon",
];

/// graphite-web imports `cairo`; this shim points it at cairocffi
const CAIRO_SHIM_DIR: &str = "/usr/local/lib/python2.7/dist-packages";

const NGINX_SITE: &str = "/etc/nginx/sites-available/graphite";
const NGINX_DEFAULT_SITE: &str = "/etc/nginx/sites-enabled/default";
const UWSGI_APP: &str = "/etc/uwsgi/apps-available/graphite.ini";
const UWSGI_DEFAULTS: &str = "/usr/share/uwsgi/conf/default.ini";
const CARBON_WRITER_JOB: &str = "/etc/init/carbon-writer.conf";
const CARBON_WRITER_CHECK: &str = "/etc/monit/conf.d/carbon-writer.conf";

pub fn base(_params: &RoleParams) -> Result<Plan> {
    let mut plan = Plan::new("base");
    plan.add(Exec::new(
        "exec:apt-update",
        "apt-get update",
        Guard::once("apt-update"),
    ))
    .add(
        Package::apt(BASE_PACKAGES)
            .named("package:base")
            .after(["exec:apt-update"]),
    )
    .add(
        Package::pip(["pip"])
            .upgrade()
            .named("package:pip-latest")
            .after(["package:base"]),
    );
    Ok(plan)
}

/// Clone a python project and install it, `creates` marking the install
fn python_project(
    plan: &mut Plan,
    name: &str,
    checkout: GitCheckout,
    dir: &str,
    creates: String,
) -> String {
    let git_id = format!("git:{}", dir);
    let requirements_id = format!("exec:{}-requirements", name);
    let install_id = format!("exec:{}-install", name);

    plan.add(checkout)
        .add(
            Exec::new(
                requirements_id.as_str(),
                "pip install -r requirements.txt",
                Guard::once(format!("{}-requirements", name)),
            )
            .in_dir(dir)
            .after([git_id]),
        )
        .add(
            Exec::new(
                install_id.as_str(),
                "python setup.py install",
                Guard::creates(creates),
            )
            .in_dir(dir)
            .after([requirements_id]),
        );
    install_id
}

pub fn graphite(params: &RoleParams) -> Result<Plan> {
    let vars = Vars::new(params);
    let root = vars.graphite_root().to_string();
    let src = vars.graphite("src");
    let ceres = format!("{}/ceres", src);
    let carbon = format!("{}/carbon", src);
    let web = format!("{}/graphite-web", src);
    let daemons = vars.graphite("conf/carbon-daemons");
    let daemon_conf = format!("{}/writer/daemon.conf", daemons);
    let db_conf = format!("{}/writer/db.conf", daemons);
    let ceres_data = vars.graphite("storage/ceres");
    let webapp = vars.graphite("webapp");
    let settings_dir = format!("{}/graphite", webapp);
    let src_dir = format!("directory:{}", src);
    let shim = format!("{}/cairo.py", CAIRO_SHIM_DIR);

    let mut plan = Plan::new("graphite");

    plan.add(User::new("graphite"))
        .add(
            Directory::new(root.as_str())
                .owner("graphite:graphite")
                .after(["user:graphite"]),
        )
        .add(
            Directory::new(src.as_str())
                .owner("graphite:graphite")
                .after([format!("directory:{}", root)]),
        );

    // ceres
    let ceres_install = python_project(
        &mut plan,
        "ceres",
        GitCheckout::new(CERES, ceres.as_str()).after([src_dir.as_str()]),
        &ceres,
        "/usr/local/bin/ceres-tree-create".to_string(),
    );
    plan.add(
        Exec::new(
            "exec:ceres-tree",
            format!("ceres-tree-create {}", quote(&ceres_data)),
            Guard::creates(format!("{}/.ceres-tree", ceres_data)),
        )
        .after([ceres_install]),
    );

    // carbon, writer daemon only
    let carbon_install = python_project(
        &mut plan,
        "carbon",
        GitCheckout::new(CARBON, carbon.as_str())
            .branch("megacarbon")
            .after([src_dir.as_str()]),
        &carbon,
        vars.graphite("bin/carbon-daemon.py"),
    );
    plan.add(
        Exec::new(
            "exec:carbon-writer-conf",
            "cp -r example writer",
            Guard::creates("writer"),
        )
        .in_dir(daemons.as_str())
        .after([carbon_install.as_str()]),
    )
    .add(
        Line::new(daemon_conf.as_str(), "USER = graphite")
            .replacing("^USER = .*$")
            .named("line:carbon-writer-user")
            .after(["exec:carbon-writer-conf"]),
    )
    .add(
        Line::new(db_conf.as_str(), "DATABASE = ceres")
            .replacing("^DATABASE = .*$")
            .named("line:carbon-writer-database")
            .after(["exec:carbon-writer-conf"]),
    )
    .add(
        Line::new(
            db_conf.as_str(),
            format!("LOCAL_DATA_DIR = {}/", ceres_data),
        )
        .replacing("^LOCAL_DATA_DIR = .*$")
        .named("line:carbon-writer-data-dir")
        .after(["line:carbon-writer-database"]),
    )
    .add(
        RemoteFile::new(CARBON_WRITER_JOB, vars.render(&CARBON_WRITER_UPSTART)?)
            .after([carbon_install.as_str()]),
    )
    .add(RemoteFile::new(
        CARBON_WRITER_CHECK,
        vars.render(&CARBON_WRITER_MONIT)?,
    ));

    // graphite-web, with cairocffi standing in for pycairo
    plan.add(Directory::new(CAIRO_SHIM_DIR)).add(
        RemoteFile::new(shim.as_str(), "from cairocffi import *\n")
            .after([format!("directory:{}", CAIRO_SHIM_DIR)]),
    );
    plan.add(
        GitCheckout::new(GRAPHITE_WEB, web.as_str()).after([src_dir.as_str()]),
    )
    .add(
        Exec::new(
            "exec:graphite-web-drop-cairo",
            "sed -i -e '/cairo/d' requirements.txt",
            Guard::unless("! grep -q cairo requirements.txt"),
        )
        .in_dir(web.as_str())
        .after([format!("git:{}", web)]),
    )
    .add(
        Exec::new(
            "exec:graphite-web-requirements",
            "pip install -r requirements.txt",
            Guard::once("graphite-web-requirements"),
        )
        .in_dir(web.as_str())
        .after(["exec:graphite-web-drop-cairo"]),
    )
    .add(Package::pip(["cairocffi"]).after(["exec:graphite-web-requirements"]))
    .add(
        Exec::new(
            "exec:graphite-web-install",
            "python setup.py install",
            Guard::creates(vars.graphite("webapp/graphite/manage.py")),
        )
        .in_dir(web.as_str())
        .after(["package:cairocffi".to_string(), format!("file:{}", shim)]),
    )
    .add(
        Exec::new(
            "exec:graphite-wsgi",
            format!(
                "cp {} wsgi.py",
                quote(&vars.graphite("conf/graphite.wsgi.example"))
            ),
            Guard::creates("wsgi.py"),
        )
        .in_dir(webapp.as_str())
        .after(["exec:graphite-web-install"]),
    )
    .add(
        Exec::new(
            "exec:graphite-local-settings",
            "cp local_settings.py.example local_settings.py",
            Guard::creates("local_settings.py"),
        )
        .in_dir(settings_dir.as_str())
        .after(["exec:graphite-web-install"]),
    );

    let mut syncdb_after = vec!["exec:graphite-local-settings"];
    let timezone = vars.get(SETTING_TIMEZONE);
    if !timezone.is_empty() {
        plan.add(
            Line::new(
                format!("{}/local_settings.py", settings_dir),
                format!("TIMEZONE = \"{}\"", timezone),
            )
            .replacing("^#?TIMEZONE = .*$")
            .named("line:graphite-timezone")
            .after(["exec:graphite-local-settings"]),
        );
        syncdb_after.push("line:graphite-timezone");
    }
    plan.add(
        Exec::new(
            "exec:graphite-syncdb",
            "python manage.py syncdb --noinput",
            Guard::creates(vars.graphite("storage/graphite.db")),
        )
        .in_dir(settings_dir.as_str())
        .after(syncdb_after),
    );

    // nginx and uwsgi
    plan.add(RemoteFile::new(NGINX_SITE, vars.render(&GRAPHITE_NGINX)?))
        .add(Exec::new(
            "exec:nginx-drop-default-site",
            format!("rm -f {}", NGINX_DEFAULT_SITE),
            Guard::removes(NGINX_DEFAULT_SITE),
        ))
        .add(RemoteFile::new(UWSGI_APP, vars.render(&GRAPHITE_UWSGI)?))
        .add(
            Line::new(UWSGI_DEFAULTS, "#uid = www-data")
                .replacing("^uid = .*$")
                .named("line:uwsgi-default-uid"),
        )
        .add(
            Line::new(UWSGI_DEFAULTS, "#gid = www-data")
                .replacing("^gid = .*$")
                .named("line:uwsgi-default-gid"),
        )
        .add(
            Symlink::new("/etc/nginx/sites-enabled/graphite", NGINX_SITE)
                .after([format!("file:{}", NGINX_SITE)]),
        )
        .add(
            Symlink::new("/etc/uwsgi/apps-enabled/graphite.ini", UWSGI_APP)
                .after([format!("file:{}", UWSGI_APP)]),
        );

    // Everything under the root is in place; hand it to the graphite user.
    // Only the owning user is enforced so the www-data group on content
    // does not fight this step.
    let installed: Vec<String> = plan.step_names().into_iter().map(String::from).collect();
    plan.add(
        Directory::new(root.as_str())
            .named("permissions:graphite")
            .owner("graphite")
            .permissions("u+rwX,g+rwX,o-rw")
            .recursive()
            .after(installed),
    )
    .add(
        Directory::new(vars.graphite("webapp/content"))
            .named("permissions:graphite-content")
            .owner("graphite:www-data")
            .permissions("o-rw")
            .recursive()
            .after(["permissions:graphite"]),
    );

    plan.add(
        Service::new("carbon-writer")
            .watching(CARBON_WRITER_JOB)
            .watching(daemon_conf.as_str())
            .watching(db_conf.as_str())
            .after(["permissions:graphite-content"]),
    )
    .add(
        Service::new("nginx")
            .watching(NGINX_SITE)
            .after(["permissions:graphite-content"]),
    )
    .add(
        Service::new("uwsgi")
            .watching(UWSGI_APP)
            .watching(UWSGI_DEFAULTS)
            .after(["permissions:graphite-content"]),
    )
    .add(
        Service::new("monit")
            .watching(CARBON_WRITER_CHECK)
            .after(["service:carbon-writer"]),
    );
    Ok(plan)
}
